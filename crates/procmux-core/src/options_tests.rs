use super::*;

#[test]
fn test_defaults_are_valid() {
    assert!(PoolOptions::default().validate().is_ok());
}

#[test]
fn test_zero_max_procs_rejected() {
    let opts = PoolOptions {
        max_procs: 0,
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    assert!(
        err.to_string()
            .contains("max_procs must be greater than or equal to 1")
    );
}

#[test]
fn test_proc_age_must_cover_timeouts() {
    // spawn timeout X, age X-1: the error names the computed minimum.
    let opts = PoolOptions {
        spawn_timeout_millis: 5_000,
        task_timeout_millis: 1_000,
        max_proc_age_millis: 4_999,
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    assert!(
        err.to_string()
            .contains("max_proc_age_millis must be greater than or equal to 5000"),
        "got: {err}"
    );
}

#[test]
fn test_proc_age_minimum_tracks_task_timeout() {
    let opts = PoolOptions {
        spawn_timeout_millis: 200,
        task_timeout_millis: 30_000,
        max_proc_age_millis: 20_000,
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    assert!(
        err.to_string()
            .contains("max_proc_age_millis must be greater than or equal to 30000")
    );
}

#[test]
fn test_spawn_timeout_floor() {
    let opts = PoolOptions {
        spawn_timeout_millis: 99,
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    assert!(
        err.to_string()
            .contains("spawn_timeout_millis must be greater than or equal to 100")
    );
}

#[test]
fn test_task_timeout_floor() {
    let opts = PoolOptions {
        task_timeout_millis: 9,
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    assert!(
        err.to_string()
            .contains("task_timeout_millis must be greater than or equal to 10")
    );
}

#[test]
fn test_blank_commands_rejected() {
    let opts = PoolOptions {
        version_command: "  ".into(),
        exit_command: String::new(),
        pass: "\t".into(),
        fail: String::new(),
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    let text = err.to_string();
    for field in ["version_command", "exit_command", "pass", "fail"] {
        assert!(text.contains(&format!("{field} must not be blank")), "{text}");
    }
}

#[test]
fn test_every_rule_broken_lists_each_once() {
    let opts = PoolOptions {
        max_procs: 0,
        max_tasks_per_process: 0,
        max_proc_age_millis: 0,
        spawn_timeout_millis: 50,
        task_timeout_millis: 5,
        version_command: String::new(),
        exit_command: String::new(),
        pass: String::new(),
        fail: String::new(),
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    let text = err.to_string();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "ProcessPool was given invalid options"
    );
    let rest: Vec<&str> = lines.collect();
    // One line per broken rule, each exactly once: the two count floors, the
    // age minimum (50 here), the two timeout floors, and four blank commands.
    assert_eq!(rest.len(), 9, "{text}");
    let mut sorted = rest.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), rest.len(), "duplicate violation lines: {text}");
}

#[test]
fn test_violations_in_declaration_order() {
    let opts = PoolOptions {
        max_procs: 0,
        spawn_timeout_millis: 50,
        max_proc_age_millis: 0,
        pass: String::new(),
        ..PoolOptions::default()
    };
    let err = opts.validate().unwrap_err();
    let text = err.to_string();
    let procs = text.find("max_procs").unwrap();
    let age = text.find("max_proc_age_millis").unwrap();
    let spawn = text.find("spawn_timeout_millis").unwrap();
    let pass = text.find("pass must not be blank").unwrap();
    assert!(procs < age && age < spawn && spawn < pass, "{text}");
}

#[test]
fn test_validated_passthrough() {
    let opts = PoolOptions::default().validated().unwrap();
    assert_eq!(opts.max_procs, 1);
    assert_eq!(opts.pass, "PASS");
}

#[test]
fn test_newline_literals() {
    assert_eq!(Newline::Lf.as_str(), "\n");
    assert_eq!(Newline::CrLf.as_str(), "\r\n");
}

#[test]
fn test_duration_accessors() {
    let opts = PoolOptions {
        task_timeout_millis: 250,
        ..PoolOptions::default()
    };
    assert_eq!(opts.task_timeout(), Duration::from_millis(250));
    assert_eq!(opts.spawn_timeout(), Duration::from_millis(15_000));
}
