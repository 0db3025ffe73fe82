use evoforge_core::backends::fake::ScriptedBackend;
use evoforge_core::engine::{open_run, ControllerSettings, EvolutionController};
use evoforge_core::errors::{is_config_error, EvolveError};
use evoforge_core::generator::GenerationPolicy;
use evoforge_core::providers::llm::fake::ScriptedProvider;
use evoforge_core::storage::Store;
use std::sync::Arc;
use std::time::Duration;

fn ledger() -> Store {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    store
}

fn settings(n_samples: u32) -> ControllerSettings {
    ControllerSettings {
        n_samples,
        build_retries: 3,
        num_snippets: 2,
        generation: GenerationPolicy {
            retries: 0,
            request_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
        },
    }
}

fn code_reply(code: &str) -> String {
    format!("Idea: {code}.\n```cpp\n{code}\n```\nDone.")
}

fn controller(
    store: &Store,
    provider: &ScriptedProvider,
    backend: &ScriptedBackend,
    run_id: &str,
    n_samples: u32,
) -> EvolutionController {
    EvolutionController::new(
        store.clone(),
        Arc::new(provider.clone()),
        Arc::new(backend.clone()),
        settings(n_samples),
        run_id,
    )
}

fn fresh_run(store: &Store, backend: &ScriptedBackend) -> String {
    let dir = tempfile::tempdir().unwrap();
    open_run(store, "webcache", "scripted", None, backend, dir.path()).unwrap()
}

#[tokio::test]
async fn scenario_a_first_build_succeeds() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    provider.push_text(code_reply("return 1;"));
    let backend = ScriptedBackend::new();
    backend.push_build(true).push_score(0.8);

    let run_id = fresh_run(&store, &backend);
    let summary = controller(&store, &provider, &backend, &run_id, 1)
        .evolve(0, 1, None)
        .await
        .unwrap();
    assert_eq!(summary.recorded, 1);
    assert_eq!(summary.best_score, Some(0.8));

    let all = store.candidates_for_run(&run_id).unwrap();
    assert_eq!(all.len(), 1);
    let rec = &all[0].record;
    assert_eq!(rec.build_status, Some(true));
    assert_eq!(rec.exec_status, Some(true));
    assert_eq!(rec.score(), Some(0.8));
    assert_eq!(rec.final_code.as_deref(), Some("return 1;"));
    assert_eq!(rec.revisions.len(), 1);
    assert_eq!(rec.revisions[0].response.text_segments, vec!["Idea: return 1;.", "Done."]);
    assert!(rec.parent_ids.is_none());
}

#[tokio::test]
async fn scenario_b_repaired_on_third_attempt() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    provider
        .push_text(code_reply("v1"))
        .push_text(code_reply("v2"))
        .push_text(code_reply("v3"));
    let backend = ScriptedBackend::new();
    backend
        .push_build(false)
        .push_build(false)
        .push_build(true)
        .push_score(0.4);

    let run_id = fresh_run(&store, &backend);
    controller(&store, &provider, &backend, &run_id, 1)
        .evolve(0, 1, None)
        .await
        .unwrap();

    let rec = store.get_candidate(&run_id, 0, 0).unwrap().unwrap().record;
    assert_eq!(rec.revisions.len(), 3);
    assert_eq!(rec.build_status, Some(true));
    assert_eq!(rec.final_code.as_deref(), Some("v3"));
    let statuses: Vec<bool> = rec.revisions.iter().map(|r| r.build_status).collect();
    assert_eq!(statuses, vec![false, false, true]);
    assert!(rec.revisions[1].prompt.contains("error: expected ';'"));
}

#[tokio::test]
async fn scenario_c_build_never_succeeds() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    provider
        .push_text(code_reply("v1"))
        .push_text(code_reply("v2"))
        .push_text(code_reply("v3"));
    let backend = ScriptedBackend::new();
    backend.push_build(false).push_build(false).push_build(false);

    let run_id = fresh_run(&store, &backend);
    let summary = controller(&store, &provider, &backend, &run_id, 1)
        .evolve(0, 1, None)
        .await
        .unwrap();
    assert_eq!(summary.built, 0);

    let rec = store.get_candidate(&run_id, 0, 0).unwrap().unwrap().record;
    assert_eq!(rec.build_status, Some(false));
    assert_eq!(rec.exec_status, None);
    assert_eq!(rec.eval_results, None);
    assert_eq!(rec.revisions.len(), 3);
    assert_eq!(backend.experiment_calls(), 0);
}

#[tokio::test]
async fn scenario_d_parents_ranked_by_score() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    for code in ["s50", "s90", "s70", "child0", "child1"] {
        provider.push_text(code_reply(code));
    }
    let backend = ScriptedBackend::new();
    backend.push_score(0.5).push_score(0.9).push_score(0.7);

    let run_id = fresh_run(&store, &backend);
    controller(&store, &provider, &backend, &run_id, 3)
        .evolve(0, 1, None)
        .await
        .unwrap();
    controller(&store, &provider, &backend, &run_id, 2)
        .evolve(1, 2, None)
        .await
        .unwrap();

    // Selection ran once and both samples of the generation reused it.
    let calls = backend.mutate_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec!["s90".to_string(), "s70".to_string()]);
    assert_eq!(calls[1], calls[0]);

    let gen0 = store.candidates_for_run(&run_id).unwrap();
    let id_of = |code: &str| {
        gen0.iter()
            .find(|c| c.record.final_code.as_deref() == Some(code))
            .map(|c| c.id)
            .unwrap()
    };
    let child = store.get_candidate(&run_id, 1, 0).unwrap().unwrap().record;
    assert_eq!(child.parent_ids, Some(vec![id_of("s90"), id_of("s70")]));
    assert_eq!(
        child.parent_codes,
        Some(vec!["s90".to_string(), "s70".to_string()])
    );
}

#[tokio::test]
async fn resumption_is_idempotent() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    for i in 0..4 {
        provider.push_text(code_reply(&format!("c{i}")));
    }
    let backend = ScriptedBackend::new();
    backend.push_score(0.1).push_score(0.2);

    let run_id = fresh_run(&store, &backend);
    controller(&store, &provider, &backend, &run_id, 2)
        .evolve(0, 2, None)
        .await
        .unwrap();
    let before = store.candidates_for_run(&run_id).unwrap();
    assert_eq!(before.len(), 4);

    let idle_provider = ScriptedProvider::new();
    let idle_backend = ScriptedBackend::new();
    let summary = controller(&store, &idle_provider, &idle_backend, &run_id, 2)
        .evolve(0, 2, None)
        .await
        .unwrap();
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.recorded, 0);
    assert_eq!(idle_provider.calls(), 0);
    assert_eq!(idle_provider.sessions(), 0);
    assert_eq!(idle_backend.build_calls(), 0);
    assert_eq!(idle_backend.experiment_calls(), 0);
    assert!(idle_backend.mutate_calls().is_empty());

    let after = store.candidates_for_run(&run_id).unwrap();
    assert_eq!(
        serde_json::to_value(&before).unwrap(),
        serde_json::to_value(&after).unwrap()
    );
    assert_eq!(store.invocation_count(&run_id).unwrap(), 2);
}

#[tokio::test]
async fn crash_loses_only_the_candidate_in_flight() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    provider.push_text(code_reply("first")).push_error("connection reset");
    let backend = ScriptedBackend::new();

    let run_id = fresh_run(&store, &backend);
    let err = controller(&store, &provider, &backend, &run_id, 3)
        .evolve(0, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EvolveError>(),
        Some(EvolveError::Generation(_))
    ));
    assert_eq!(store.candidates_for_run(&run_id).unwrap().len(), 1);

    let provider = ScriptedProvider::new();
    provider.push_text(code_reply("second")).push_text(code_reply("third"));
    controller(&store, &provider, &backend, &run_id, 3)
        .evolve(0, 1, None)
        .await
        .unwrap();

    let codes: Vec<_> = store
        .candidates_for_run(&run_id)
        .unwrap()
        .into_iter()
        .map(|c| (c.record.sample, c.record.final_code.unwrap()))
        .collect();
    assert_eq!(
        codes,
        vec![
            (0, "first".to_string()),
            (1, "second".to_string()),
            (2, "third".to_string())
        ]
    );
}

#[tokio::test]
async fn too_few_parents_is_fatal_before_prompting() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    provider
        .push_text(code_reply("good"))
        .push_text(code_reply("bad"));
    let backend = ScriptedBackend::new();
    backend.push_build(true).push_score(0.3).push_build(true).push_exec_failure();

    let run_id = fresh_run(&store, &backend);
    controller(&store, &provider, &backend, &run_id, 2)
        .evolve(0, 1, None)
        .await
        .unwrap();

    let calls_before = provider.calls();
    let err = controller(&store, &provider, &backend, &run_id, 2)
        .evolve(1, 2, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EvolveError>(),
        Some(EvolveError::InsufficientParents { iter: 0, found: 1 })
    ));
    assert!(backend.mutate_calls().is_empty());
    assert_eq!(provider.calls(), calls_before);
}

#[tokio::test]
async fn selection_sees_every_earlier_generation() {
    let store = ledger();
    let provider = ScriptedProvider::new();
    for code in ["a", "b", "c", "d", "e", "f"] {
        provider.push_text(code_reply(code));
    }
    let backend = ScriptedBackend::new();
    // gen0: a=0.9, b=0.1; gen1: c=0.5, d=0.95
    backend
        .push_score(0.9)
        .push_score(0.1)
        .push_score(0.5)
        .push_score(0.95);

    let run_id = fresh_run(&store, &backend);
    controller(&store, &provider, &backend, &run_id, 2)
        .evolve(0, 3, None)
        .await
        .unwrap();

    let calls = backend.mutate_calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0], vec!["a".to_string(), "b".to_string()]);
    assert_eq!(calls[2], vec!["d".to_string(), "a".to_string()]);
}

#[test]
fn continuing_requires_matching_run() {
    let store = ledger();
    let backend = ScriptedBackend::new();
    let dir = tempfile::tempdir().unwrap();
    let run_id = open_run(&store, "webcache", "m", None, &backend, dir.path()).unwrap();
    assert_eq!(run_id, "webcache_0");
    assert_eq!(
        open_run(&store, "webcache", "m", None, &backend, dir.path()).unwrap(),
        "webcache_1"
    );

    let err = open_run(&store, "tcp", "m", Some("webcache_0"), &backend, dir.path()).unwrap_err();
    assert!(is_config_error(&err));
    let err = open_run(&store, "tcp", "m", Some("tcp_7"), &backend, dir.path()).unwrap_err();
    assert!(is_config_error(&err));

    let info = store.run_info("webcache_0").unwrap().unwrap();
    assert_eq!(info.info["run_id"], "webcache_0");
    assert_eq!(info.info["task_args"]["scripted"], true);
}
