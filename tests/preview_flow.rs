use preview_sandbox::channel::HostMessage;
use preview_sandbox::dependencies::detect;
use preview_sandbox::{
    build_policy, EngineConfig, PreviewEngine, PreviewStatus, SandboxError, SandboxStatus,
    SourceBundle,
};
use regex::Regex;
use std::fs;

const COUNTER: &str = r#"import React, { useState } from 'react';
export default function App() {
  const [count, setCount] = useState(0);
  return <button onClick={() => setCount(count + 1)}>Count {count}</button>;
}
"#;

const ROUTED: &str = r#"import { BrowserRouter, Routes, Route } from 'react-router-dom';
import { motion } from 'framer-motion';
import axios from 'axios';
export default function App() {
  return (
    <BrowserRouter>
      <motion.div animate={{ opacity: 1 }}>
        <Routes><Route path="/" element={<h1>Home</h1>} /></Routes>
      </motion.div>
    </BrowserRouter>
  );
}
"#;

fn handle_of(url: &str) -> &str {
    url.rsplit('/').next().unwrap()
}

#[test]
fn two_generations_get_distinct_ids_and_both_stay_live() {
    let engine = PreviewEngine::default();
    let first = engine.generate_preview(&SourceBundle::from_frontend(COUNTER));
    let second = engine.generate_preview(&SourceBundle::from_frontend(ROUTED));

    let first_id = first.sandbox_id.unwrap();
    let second_id = second.sandbox_id.unwrap();
    assert_ne!(first_id, second_id);
    assert!(engine.environment(&first_id).is_some());
    assert!(engine.environment(&second_id).is_some());
    assert_eq!(engine.sandbox_ids().len(), 2);
}

#[test]
fn cleanup_forgets_sandbox_and_ignores_unknown_ids() {
    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&SourceBundle::from_frontend(COUNTER));
    let id = result.sandbox_id.unwrap();

    assert!(engine.cleanup_preview_environment(&id));
    assert!(engine.environment(&id).is_none());
    assert!(engine.document(handle_of(&result.url)).is_none());
    assert!(!engine.cleanup_preview_environment("sbx-never-issued"));
}

#[test]
fn empty_bundle_reports_error_instead_of_failing() {
    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&SourceBundle::new());
    assert_eq!(result.status, PreviewStatus::Error);
    assert!(result.sandbox_id.is_none());
    assert!(!result.error.unwrap_or_default().is_empty());
    assert!(result.url.starts_with("data:text/html;base64,"));
}

#[test]
fn whitespace_entry_is_rejected() {
    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&SourceBundle::from_frontend("   \n\t"));
    assert_eq!(result.status, PreviewStatus::Error);
    assert!(engine.sandbox_ids().is_empty());
}

#[test]
fn router_import_is_detected_with_urls() {
    let detected = detect("import {BrowserRouter} from 'react-router-dom'");
    let router = detected
        .iter()
        .find(|d| d.name == "react-router-dom")
        .expect("router dependency");
    assert!(!router.primary_urls.is_empty());
    assert!(router.primary_urls.iter().all(|u| !u.is_empty()));
}

#[test]
fn policy_covers_every_dependency_tag_in_document() {
    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&SourceBundle::from_frontend(ROUTED));
    assert!(result.is_ready());
    let served = engine.document(handle_of(&result.url)).unwrap();

    let policy = build_policy(&detect(ROUTED));
    let primary = Regex::new(r#"(?:src|href)="([^"]+)" data-sandbox-dependency"#).unwrap();
    let fallbacks = Regex::new(r#"data-fallbacks="([^"]*)""#).unwrap();

    let mut urls: Vec<String> = primary
        .captures_iter(&served.html)
        .map(|c| c[1].to_string())
        .collect();
    for caps in fallbacks.captures_iter(&served.html) {
        let json = caps[1].replace("&quot;", "\"");
        let list: Vec<String> = serde_json::from_str(&json).unwrap();
        urls.extend(list);
    }

    assert!(urls.len() >= 4, "expected baseline plus detected tags, got {:?}", urls);
    for url in &urls {
        assert!(policy.permits_url(url), "policy misses {}", url);
    }
    assert_eq!(served.policy, policy_with_channel(&engine, &result, &served.html));
}

fn policy_with_channel(
    engine: &PreviewEngine,
    result: &preview_sandbox::PreviewResult,
    html: &str,
) -> String {
    let id = result.sandbox_id.as_deref().unwrap();
    let token = Regex::new(r"token=([0-9a-f]+)").unwrap().captures(html).unwrap()[1].to_string();
    let mut policy = build_policy(&detect(ROUTED));
    policy.allow_connect(&engine.config().channel_url(id, &token).unwrap());
    policy.render()
}

#[test]
fn preview_document_cannot_reach_control_origin() {
    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&SourceBundle::from_frontend(COUNTER));
    let id = result.sandbox_id.clone().unwrap();
    assert!(result.url.starts_with("http://127.0.0.1:4174/preview/"));
    let served = engine.document(handle_of(&result.url)).unwrap();

    let connect = served
        .policy
        .split(';')
        .map(str::trim)
        .find(|d| d.starts_with("connect-src"))
        .unwrap()
        .to_string();
    assert!(!connect.contains("'self'"));
    assert!(!connect.contains(":4173"));
    assert!(connect.contains(&format!("ws://127.0.0.1:4174/sandboxes/{}/channel", id)));
}

#[test]
fn shared_cdn_origin_is_listed_once() {
    let policy = build_policy(&detect(ROUTED));
    let unpkg = policy
        .origins()
        .iter()
        .filter(|o| o.as_str() == "https://unpkg.com")
        .count();
    assert_eq!(unpkg, 1);
}

#[test]
fn dangerous_constructs_never_reach_document() {
    let engine = PreviewEngine::default();
    let source = format!("{}\neval(userInput);\n", COUNTER);
    let result = engine.generate_preview(&SourceBundle::from_frontend(source));
    let served = engine.document(handle_of(&result.url)).unwrap();
    assert!(!served.html.contains("eval(userInput)"));
    let security = result.security.unwrap();
    assert!(security.blocked_constructs > 0);
}

#[test]
fn directory_bundle_uses_app_entry() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/App.jsx"), COUNTER).unwrap();
    fs::write(dir.path().join("src/index.css"), "body { margin: 0; }").unwrap();
    fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
    fs::write(dir.path().join("node_modules/react/index.js"), "module.exports = {}").unwrap();

    let bundle = SourceBundle::load(dir.path()).unwrap();
    assert_eq!(bundle.len(), 2);

    let engine = PreviewEngine::default();
    let result = engine.generate_preview(&bundle);
    assert!(result.is_ready());
    let served = engine.document(handle_of(&result.url)).unwrap();
    assert!(served.html.contains("body { margin: 0; }"));
}

#[tokio::test]
async fn inspect_unknown_sandbox_fails_immediately() {
    let engine = PreviewEngine::default();
    let err = engine.inspect_element("sbx-missing", "#missing").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound(_)));
}

#[tokio::test]
async fn inspect_times_out_when_sandbox_stays_silent() {
    let engine = PreviewEngine::new(EngineConfig {
        inspect_timeout_ms: 30,
        ..Default::default()
    });
    let id = engine
        .generate_preview(&SourceBundle::from_frontend(COUNTER))
        .sandbox_id
        .unwrap();
    let (_session, mut outbound) = engine.attach_channel(&id).unwrap();

    let err = engine.inspect_element(&id, "#missing").await.unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
    assert_eq!(
        outbound.recv().await,
        Some(HostMessage::InspectElement {
            selector: "#missing".to_string()
        })
    );

    // The abandoned request no longer blocks the selector
    let err = engine.inspect_element(&id, "#missing").await.unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
}

#[tokio::test]
async fn element_info_reply_settles_inspection() {
    let engine = PreviewEngine::default();
    let id = engine
        .generate_preview(&SourceBundle::from_frontend(COUNTER))
        .sandbox_id
        .unwrap();
    let (session, mut outbound) = engine.attach_channel(&id).unwrap();

    let inspector = engine.clone();
    let target = id.clone();
    let pending = tokio::spawn(async move { inspector.inspect_element(&target, "button").await });

    let request = outbound.recv().await.unwrap();
    assert!(matches!(request, HostMessage::InspectElement { .. }));
    engine
        .dispatch(
            &id,
            session,
            r#"{"type":"element-info","selector":"button","info":{"tagName":"BUTTON","textContent":"Count 0","childCount":1}}"#,
        )
        .unwrap();

    let info = pending.await.unwrap().unwrap();
    assert_eq!(info.tag_name, "BUTTON");
    assert_eq!(info.child_count, 1);
}

#[tokio::test]
async fn reconnect_rejects_pending_inspection() {
    let engine = PreviewEngine::default();
    let id = engine
        .generate_preview(&SourceBundle::from_frontend(COUNTER))
        .sandbox_id
        .unwrap();
    let (first, mut outbound) = engine.attach_channel(&id).unwrap();

    let inspector = engine.clone();
    let target = id.clone();
    let pending = tokio::spawn(async move { inspector.inspect_element(&target, "h1").await });
    outbound.recv().await.unwrap();

    let (second, _outbound) = engine.attach_channel(&id).unwrap();
    assert!(second > first);
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SandboxError::SessionReset(_)));
}

#[test]
fn messages_queued_while_detached_flush_on_attach() {
    let engine = PreviewEngine::default();
    let id = engine
        .generate_preview(&SourceBundle::from_frontend(COUNTER))
        .sandbox_id
        .unwrap();

    engine.full_reload(&id).unwrap();
    let (session, mut outbound) = engine.attach_channel(&id).unwrap();
    assert_eq!(outbound.try_recv().unwrap(), HostMessage::FullReload);

    engine.dispatch(&id, session, r#"{"type":"ready"}"#).unwrap();
    assert_eq!(engine.environment(&id).unwrap().status, SandboxStatus::Ready);

    engine.cleanup_preview_environment(&id);
    assert!(matches!(
        engine.dispatch(&id, session, r#"{"type":"ready"}"#),
        Err(SandboxError::ChannelClosed(_))
    ));
}

#[test]
fn suite_passes_for_clean_ready_sandbox() {
    let engine = PreviewEngine::default();
    let id = engine
        .generate_preview(&SourceBundle::from_frontend(
            "export default function App() { return <main><h1>Hello</h1></main>; }",
        ))
        .sandbox_id
        .unwrap();
    let (session, _outbound) = engine.attach_channel(&id).unwrap();
    engine.dispatch(&id, session, r#"{"type":"ready"}"#).unwrap();

    let report = engine.run_tests(&id).unwrap();
    let failed: Vec<_> = report.cases.iter().filter(|c| !c.passed()).collect();
    assert!(report.success(), "failed cases: {:?}", failed);
    assert_eq!(report.total, 8);
}
