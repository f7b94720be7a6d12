use playbooks_core::checkpoint::FilesystemCheckpointProvider;
use playbooks_core::completion::ScriptedCompletionProvider;
use playbooks_core::identifiers::AgentID;
use playbooks_core::program::Program;
use playbooks_core::{Agent, RuntimeConfig, Value};
use std::sync::Arc;
use tempfile::tempdir;

const SOURCE: &str = "\
# Greeter
Welcomes a visitor.

## Main
### Triggers
- at program start
### Steps
- s1: EXE $greeting = \"hello\"
- s2: YLD user
";

#[tokio::test]
async fn playbook_runs_at_program_start_and_suspends_on_user_yield() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.durability.storage_path = dir.path().to_path_buf();

    let completion = Arc::new(ScriptedCompletionProvider::new(vec![
        "s1: EXE $greeting = \"hello\"\ns2: YLD user\n".to_string(),
    ]));
    let checkpoint = Arc::new(FilesystemCheckpointProvider::new(dir.path(), 8));
    let program = Program::new(config, completion, checkpoint);

    program.load_playbooks(SOURCE).await.unwrap();

    let greeter = program.get_agent(&AgentID::new("greeter")).await.expect("greeter registered");
    match &greeter {
        Agent::Ai { execution_state, .. } => {
            assert!(execution_state.is_active());
            assert_eq!(
                execution_state.state_vars.get("greeting"),
                Some(&Value::String("hello".to_string()))
            );
        }
        _ => panic!("expected an AI agent"),
    }

    program.shutdown().await.unwrap();
}
