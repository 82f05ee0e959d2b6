use std::path::Path;
use std::time::Duration;

use ari_web_core::config::{config_path, AppConfig, StoreBackend};
use ari_web_core::job::registry::INTERRUPTED_BANNER;
use ari_web_core::job::{open_job_store, Job, JobView, PollStatus};
use ari_web_core::server::{app_state_with_config, AppState};
use tempfile::tempdir;

fn config_for(store: StoreBackend) -> AppConfig {
    let mut config = AppConfig::default();
    config.jobs.store = store;
    config.jobs.settle_delay_secs = 0;
    config.jobs.shell = "/bin/sh".to_string();
    config
}

fn boot(config: &AppConfig, data_dir: &Path) -> AppState {
    app_state_with_config(config.clone(), config_path(data_dir), data_dir.to_path_buf())
        .expect("build app state")
}

fn wait_for_terminal(state: &AppState, id: &str) -> JobView {
    for _ in 0..200 {
        let view = state.controller().status(id);
        if matches!(view.status, PollStatus::Completed | PollStatus::Failed) {
            return view;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("job {id} did not reach terminal status within timeout");
}

#[cfg(unix)]
fn finished_job_survives_restart(store: StoreBackend) {
    let data_dir = tempdir().expect("tempdir");
    let config = config_for(store);

    let (id, before) = {
        let state = boot(&config, data_dir.path());
        let id = state
            .controller()
            .start(ari_web_core::job::Invocation {
                label: "Restart probe".to_string(),
                program: "/bin/sh".to_string(),
                args: Vec::new(),
                script: "echo first\necho second\n".to_string(),
                script_extension: "sh".to_string(),
            })
            .expect("start job");
        let before = wait_for_terminal(&state, &id);
        assert_eq!(state.controller().flush(), 0);
        (id, before)
    };
    assert_eq!(before.status, PollStatus::Completed);

    let restarted = boot(&config, data_dir.path());
    let after = restarted.controller().status(&id);
    assert_eq!(after.status, PollStatus::Completed);
    assert_eq!(after.output, before.output);
    assert_eq!(after.created_at, before.created_at);
    assert!(after.output.contains("first<br>second<br>"));
}

#[cfg(unix)]
#[test]
fn finished_job_survives_restart_with_sqlite_store() {
    finished_job_survives_restart(StoreBackend::Sqlite);
}

#[cfg(unix)]
#[test]
fn finished_job_survives_restart_with_json_store() {
    finished_job_survives_restart(StoreBackend::Json);
}

#[test]
fn job_left_running_by_a_crash_is_reported_failed() {
    let data_dir = tempdir().expect("tempdir");
    let config = config_for(StoreBackend::Sqlite);
    std::fs::create_dir_all(data_dir.path()).expect("data dir");

    let store = open_job_store(&config, data_dir.path()).expect("open store");
    let mut job = Job::new_running("crashed-job".to_string());
    job.append("Starting Azure CLI device login...<br>");
    job.append("halfway<br>");
    store.save(&job).expect("save running job");
    drop(store);

    let state = boot(&config, data_dir.path());
    let view = state.controller().status("crashed-job");
    assert_eq!(view.status, PollStatus::Failed);
    assert!(view
        .output
        .starts_with("Starting Azure CLI device login...<br>halfway<br>"));
    assert!(view.output.ends_with(INTERRUPTED_BANNER));

    let unknown = state.controller().status("never-created");
    assert_eq!(unknown.status, PollStatus::NotFound);
}
