//! Replay scripts and config files from disk, the way the CLI runs them.

use concord::{Concord, OperationOutcome, RootConfig};
use concord_core::{PolicyKey, PolicyScope, PolicyUpdateResult, PolicyValue};
use std::io::{BufReader, Write};

const CONFIG: &str = r#"
[engine]
default_importance = 1

[notify]
log_updates = false

[capabilities]
unsupported = ["user-restriction/no_cellular_2g"]

[[policies]]
identifier = "kiosk-mode"
mechanism = "topmost_authority"
scope = "global"
"#;

const SCRIPT: &str = r#"{"op":"set","key":{"identifier":"kiosk-mode"},"admin":{"package":"com.kiosk","user_id":0},"value":{"type":"string","value":"com.kiosk.app"},"importance":10}
{"op":"set","key":{"identifier":"kiosk-mode"},"admin":{"package":"com.helper","user_id":0,"permission_based":true},"value":{"type":"string","value":"com.helper.app"}}
{"op":"set","key":{"identifier":"user-restriction/no_cellular_2g"},"admin":{"package":"com.kiosk","user_id":0},"value":{"type":"boolean","value":true}}
{"op":"set","key":{"identifier":"kiosk-mode"},"admin":{"package":"com.helper","user_id":0,"permission_based":true},"value":{"type":"integer","value":3}}

{"op":"remove_admin","admin":{"package":"com.kiosk","user_id":0}}
"#;

#[test]
fn replay_script_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, CONFIG).unwrap();

    let mut script = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
    script.write_all(SCRIPT.as_bytes()).unwrap();
    script.flush().unwrap();

    let config = RootConfig::load(&config_path).unwrap();
    assert_eq!(config.engine.default_importance, 1);
    let concord = Concord::from_config(config).unwrap();

    let file = std::fs::File::open(script.path()).unwrap();
    let report = concord.replay(BufReader::new(file)).unwrap();
    assert_eq!(report.steps.len(), 5);

    // The helper's lower-importance value loses to the kiosk.
    match &report.steps[1].outcome {
        OperationOutcome::Set(result) => {
            assert!(result.accepted);
            assert_eq!(
                result.outcome,
                PolicyUpdateResult::FailureConflictingAdminPolicy
            );
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // Unsupported hardware.
    match &report.steps[2].outcome {
        OperationOutcome::Set(result) => {
            assert!(!result.accepted);
            assert_eq!(result.outcome, PolicyUpdateResult::FailureHardwareLimitation);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // Wrong value type is refused and the replay carries on.
    assert!(matches!(
        &report.steps[3].outcome,
        OperationOutcome::Failed { kind, .. } if kind == "TypeMismatch"
    ));
    assert_eq!(report.steps[4].line, 6);

    // With the kiosk gone the helper's value takes over.
    match &report.steps[4].outcome {
        OperationOutcome::RemoveAdmin { affected } => {
            assert_eq!(affected, &vec![PolicyKey::new("kiosk-mode")]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let state = report
        .final_state
        .get(&PolicyKey::new("kiosk-mode"), PolicyScope::Global)
        .unwrap();
    assert_eq!(state.resolved_value, Some(PolicyValue::from("com.helper.app")));

    assert_eq!(report.notifications.pending, 0);
    assert_eq!(report.notifications.failed, 0);

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"final_state\""));
}
