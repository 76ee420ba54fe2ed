use broadside::{
    AdmissionPolicy, BroadsideError, CancellationReason, Extractor, ExtractorConfig, MemoryLog,
    MockCallKind, MockRenderHost, RenderReply, RenderResult, ReportAggregator,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn rendered(thumbnail: &str, mismatch: bool) -> RenderReply {
    RenderReply::Rendered(RenderResult {
        thumbnail_ref: thumbnail.to_string(),
        width: 1200,
        height: 628,
        extracted_text: "Summer sale".to_string(),
        section_id: Some("banners".to_string()),
        version: Some("2".to_string()),
        source_template_id: None,
        transparency_mismatch: mismatch,
    })
}

fn test_config() -> ExtractorConfig {
    ExtractorConfig {
        max_instances: 3,
        max_per_instance: 10,
        watchdog_interval_ms: 50,
        deadline_ms: 5_000,
        ..Default::default()
    }
}

fn extractor_with_logs(
    host: &MockRenderHost,
    config: ExtractorConfig,
) -> (Extractor<MockRenderHost>, Arc<MemoryLog>, Arc<MemoryLog>) {
    let fonts = Arc::new(MemoryLog::new());
    let mismatches = Arc::new(MemoryLog::new());
    let extractor = Extractor::new(Arc::new(host.clone()), config)
        .with_aggregator(ReportAggregator::new(Some(fonts.clone()), Some(mismatches.clone())));
    (extractor, fonts, mismatches)
}

#[test_log::test(tokio::test)]
async fn test_full_batch_preserves_every_reference() {
    // Setup: ten designs with a mix of outcomes, submitted in thumbnail form too
    let host = MockRenderHost::new();
    for i in 0..6 {
        let id = format!("d{i}.bfd");
        host.add_design(&id, 1024, rendered(&format!("thumbs/d{i}.png"), i == 2));
    }
    host.add_design(
        "d6.bfd",
        512,
        RenderReply::FontSwap {
            fonts: vec!["Lato".to_string(), "Inter".to_string()],
        },
    );
    host.add_design(
        "d7.bfd",
        512,
        RenderReply::FontSwap {
            fonts: vec!["Lato".to_string()],
        },
    );
    host.add_fetch("d8.bfd", Err(BroadsideError::AssetFetch("404".to_string())));
    host.add_fetch("d8.bfd", Err(BroadsideError::AssetFetch("404".to_string())));
    host.add_fetch("d9.bfd", Ok(2048));
    host.add_render("d9.bfd", Err(BroadsideError::Render("host crashed".to_string())));

    let mut raw: Vec<String> = (0..10).map(|i| format!("d{i}.bfd")).collect();
    raw[2] = "d2.bfd_thumb.png".to_string();
    raw.push("d0.bfd".to_string()); // duplicate
    raw.push("notes.txt".to_string()); // invalid

    let (extractor, fonts, mismatches) = extractor_with_logs(&host, test_config());

    // Execute
    let report = extractor.extract(&raw).await.expect("batch should succeed");

    // Verify: every admitted reference landed in exactly one bucket
    assert!(!report.timed_out);
    assert_eq!(report.counts.submitted, 12);
    assert_eq!(report.counts.admitted, 10);
    assert_eq!(report.opened.len(), 6);
    assert_eq!(report.font_swap.len(), 2);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.unopened.len(), 1);

    let mut seen: Vec<String> = report
        .opened
        .iter()
        .map(|d| d.reference.clone())
        .chain(report.font_swap.iter().map(|d| d.reference.clone()))
        .chain(report.missing.iter().map(|d| d.reference.clone()))
        .chain(report.unopened.iter().map(|d| d.reference.clone()))
        .collect();
    seen.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("d{i}.bfd")).collect();
    expected.sort();
    assert_eq!(seen, expected);

    // Verify: three sessions with 4, 3 and 3 distinct references each
    let mut per_session: HashMap<_, Vec<String>> = HashMap::new();
    for call in host.get_calls() {
        if call.kind == MockCallKind::Fetch {
            let refs = per_session.entry(call.session_id).or_default();
            let reference = call.reference.expect("fetches carry a reference");
            if !refs.contains(&reference) {
                refs.push(reference);
            }
        }
    }
    let mut sizes: Vec<usize> = per_session.values().map(Vec::len).collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, vec![4, 3, 3]);

    for session_id in host.opened_sessions() {
        assert_eq!(host.terminate_count(session_id), 1);
    }
    assert_eq!(host.peak_render_concurrency(), 1);

    // Verify: side-effect logs
    assert_eq!(fonts.lines(), vec!["Lato", "Inter", "Lato"]);
    assert_eq!(mismatches.lines(), vec!["thumbs/d2.png"]);

    assert_eq!(report.missing[0].error, "404");
    assert_eq!(report.unopened[0].error, "host crashed");
    assert!(report.summary.starts_with("Processed 10/10 designs"));
    assert_eq!(extractor.active_batches(), 0);
}

#[tokio::test]
async fn test_deadline_returns_partial_report_without_duplicates() {
    // Setup: one quick design per session, then a design that never renders
    let host = MockRenderHost::new();
    host.add_design("a.bfd", 1, rendered("a.png", false));
    host.add_fetch_delayed("b.bfd", Duration::from_millis(20), Ok(1));
    host.add_render_hanging("b.bfd");
    host.add_design("c.bfd", 1, rendered("c.png", false));
    host.add_fetch_hanging("d.bfd");

    let config = ExtractorConfig {
        max_instances: 2,
        deadline_ms: 200,
        ..test_config()
    };
    let (extractor, _, _) = extractor_with_logs(&host, config);

    // Execute
    let report = extractor
        .extract(&["a.bfd", "b.bfd", "c.bfd", "d.bfd"])
        .await
        .expect("timeouts are reported, not raised");

    // Verify
    assert!(report.timed_out);
    assert_eq!(report.cancellation, Some(CancellationReason::Deadline));
    assert!(report.summary.starts_with("[TIMED OUT] "));
    let opened: Vec<&str> = report.opened.iter().map(|d| d.reference.as_str()).collect();
    assert_eq!(opened, vec!["a.bfd", "c.bfd"]);
    assert!(report.missing.is_empty());
    assert!(report.unopened.is_empty());
    assert_eq!(report.counts.unsettled, 2);

    let sessions = host.opened_sessions();
    assert_eq!(sessions.len(), 2);
    for session_id in sessions {
        assert_eq!(host.terminate_count(session_id), 1);
    }
    assert_eq!(host.in_flight_count(), 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["timed_out"], true);
    assert_eq!(json["cancellation"], "deadline");
}

#[tokio::test]
async fn test_host_launch_failure_is_an_error_and_releases_the_gate() {
    let host = MockRenderHost::new();
    host.fail_next_open("browser binary not found");
    let (extractor, _, _) = extractor_with_logs(&host, test_config());

    let err = extractor.extract(&["a.bfd"]).await.unwrap_err();
    assert!(matches!(err, BroadsideError::HostLaunch { .. }));
    assert_eq!(err.status_code(), 502);
    assert!(!err.is_admission_rejection());

    // The failed batch gave its permit back
    host.add_design("a.bfd", 1, rendered("a.png", false));
    let report = extractor.extract(&["a.bfd"]).await.unwrap();
    assert_eq!(report.opened.len(), 1);
}

#[tokio::test]
async fn test_second_batch_rejected_while_first_runs() {
    let host = MockRenderHost::new();
    let release = host.add_fetch_with_trigger("slow.bfd", Ok(1));
    host.add_render("slow.bfd", Ok(rendered("slow.png", false)));

    let (extractor, _, _) = extractor_with_logs(&host, test_config());
    let extractor = Arc::new(extractor);

    let first = {
        let extractor = extractor.clone();
        tokio::spawn(async move { extractor.extract(&["slow.bfd"]).await })
    };

    // Wait for the first batch to hold the gate
    while extractor.active_batches() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = extractor.extract(&["other.bfd"]).await.unwrap_err();
    assert!(matches!(err, BroadsideError::AlreadyRunning));
    assert_eq!(err.status_code(), 429);
    assert!(err.is_admission_rejection());

    release.send(()).unwrap();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.opened.len(), 1);
    assert_eq!(extractor.active_batches(), 0);
}

#[tokio::test]
async fn test_capacity_policy_admits_up_to_cap() {
    let host = MockRenderHost::new();
    let release_a = host.add_fetch_with_trigger("a.bfd", Ok(1));
    host.add_render("a.bfd", Ok(rendered("a.png", false)));
    host.add_design("b.bfd", 1, rendered("b.png", false));

    let config = ExtractorConfig {
        admission: AdmissionPolicy::Capacity { max_active: 2 },
        ..test_config()
    };
    let (extractor, _, _) = extractor_with_logs(&host, config);
    let extractor = Arc::new(extractor);

    let first = {
        let extractor = extractor.clone();
        tokio::spawn(async move { extractor.extract(&["a.bfd"]).await })
    };
    while extractor.active_batches() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second batch fits under the cap
    let second = extractor.extract(&["b.bfd"]).await.unwrap();
    assert_eq!(second.opened.len(), 1);

    release_a.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap().opened.len(), 1);
}

#[tokio::test]
async fn test_oversized_batch_rejected_before_any_session() {
    let host = MockRenderHost::new();
    let config = ExtractorConfig {
        max_instances: 2,
        max_per_instance: 2,
        ..test_config()
    };
    let (extractor, _, _) = extractor_with_logs(&host, config);

    let raw: Vec<String> = (0..5).map(|i| format!("d{i}.bfd")).collect();
    let err = extractor.extract(&raw).await.unwrap_err();

    assert!(matches!(err, BroadsideError::BatchTooLarge { count: 5, max: 4 }));
    assert_eq!(err.status_code(), 413);
    assert!(host.opened_sessions().is_empty());
    assert_eq!(extractor.active_batches(), 0);
}

#[tokio::test]
async fn test_fetch_retried_once_before_missing() {
    let host = MockRenderHost::new();
    host.add_fetch("flaky.bfd", Err(BroadsideError::AssetFetch("timeout".to_string())));
    host.add_fetch("flaky.bfd", Ok(10));
    host.add_render("flaky.bfd", Ok(rendered("flaky.png", false)));
    for _ in 0..3 {
        host.add_fetch("gone.bfd", Err(BroadsideError::AssetFetch("404".to_string())));
    }

    let (extractor, _, _) = extractor_with_logs(&host, test_config());
    let report = extractor.extract(&["flaky.bfd", "gone.bfd"]).await.unwrap();

    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].reference, "gone.bfd");

    let gone_fetches = host
        .get_calls()
        .iter()
        .filter(|c| c.kind == MockCallKind::Fetch && c.reference.as_deref() == Some("gone.bfd"))
        .count();
    assert_eq!(gone_fetches, 2);
}

#[tokio::test]
async fn test_shutdown_token_drains_running_batch() {
    let host = MockRenderHost::new();
    host.add_design("a.bfd", 1, rendered("a.png", false));
    host.add_fetch_hanging("b.bfd");

    let shutdown = CancellationToken::new();
    let config = ExtractorConfig {
        max_instances: 1,
        ..test_config()
    };
    let (extractor, _, _) = extractor_with_logs(&host, config);
    let extractor = extractor.with_shutdown_token(shutdown.clone());

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = extractor.extract(&["a.bfd", "b.bfd"]).await.unwrap();
    assert!(report.timed_out);
    assert_eq!(report.cancellation, Some(CancellationReason::Shutdown));
    assert!(report.summary.starts_with("[SHUTDOWN] "));
    assert_eq!(report.opened.len(), 1);
}

#[tokio::test]
async fn test_file_logs_appended_across_batches() {
    let dir = tempfile::tempdir().unwrap();
    let font_log = dir.path().join("fonts.log");
    let mismatch_log = dir.path().join("mismatch.log");

    let host = MockRenderHost::new();
    for _ in 0..2 {
        host.add_design(
            "a.bfd",
            1,
            RenderReply::FontSwap {
                fonts: vec!["Roboto".to_string()],
            },
        );
        // Thumbnail entries normalize to the design reference
        host.add_design("b.bfd", 1, rendered("thumbs/b.png", true));
    }

    let config = ExtractorConfig {
        font_log_path: Some(font_log.clone()),
        mismatch_log_path: Some(mismatch_log.clone()),
        ..test_config()
    };
    let extractor = Extractor::new(Arc::new(host.clone()), config);

    extractor.extract(&["a.bfd", "b.bfd_thumb.png"]).await.unwrap();
    extractor.extract(&["a.bfd", "b.bfd_thumb.png"]).await.unwrap();

    let fonts = std::fs::read_to_string(&font_log).unwrap();
    assert_eq!(fonts, "Roboto\nRoboto\n");
    let mismatches = std::fs::read_to_string(&mismatch_log).unwrap();
    assert_eq!(mismatches, "thumbs/b.png\nthumbs/b.png\n");
}

#[tokio::test]
async fn test_slow_session_launch_past_deadline_is_released() {
    // Setup: both sessions take longer to open than the whole batch may run
    let host = MockRenderHost::new();
    host.delay_next_open(Duration::from_millis(200));
    host.delay_next_open(Duration::from_millis(200));

    let config = ExtractorConfig {
        max_instances: 2,
        deadline_ms: 50,
        ..test_config()
    };
    let (extractor, _, _) = extractor_with_logs(&host, config);

    // Execute
    let report = extractor.extract(&["a.bfd", "b.bfd"]).await.unwrap();

    // Verify: opens == terminations
    assert!(report.timed_out);
    let sessions = host.opened_sessions();
    assert_eq!(sessions.len(), 2);
    let terminated: usize = sessions.iter().map(|id| host.terminate_count(*id)).sum();
    assert_eq!(terminated, 2);
    assert_eq!(host.call_count(MockCallKind::Terminate), 2);
}
