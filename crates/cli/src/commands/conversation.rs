use std::sync::Arc;

use parley_agent::{
    llm::provider_from_config, responder_from_config, ActorEnvironment, ActorError,
    ActorRegistry, ActorSettings, ManualWakeScheduler, ProcessOutcome, RecordingChatSink,
    ToolRegistry, WakeScheduler,
};
use parley_core::audit::TracingAuditSink;
use parley_core::config::AppConfig;
use parley_core::domain::conversation::ConversationKey;
use parley_core::domain::io::ParsedInput;
use parley_db::{connection::connect_with_config, migrations, SqlConversationStore};
use serde_json::json;

use crate::commands::{
    load_config, runtime, CommandResult, EXIT_AGENT, EXIT_DATABASE, EXIT_INPUT, EXIT_MIGRATION,
};

pub const EXIT_STORE: u8 = 8;
const CLI_PLATFORM: &str = "cli";

type Failure = (&'static str, String, u8);

struct LocalRuntime {
    registry: ActorRegistry,
    scheduler: ManualWakeScheduler,
    sink: RecordingChatSink,
}

/// Queues one message, fires its wake-up immediately and reports the result.
pub fn send(key: &str, user: &str, text: &str) -> CommandResult {
    with_registry("send", key, |local, key| async move {
        let input = ParsedInput::new(text, user, key.as_str()).with_platform(CLI_PLATFORM);
        let receipt = local.registry.receive(&key, input).await.map_err(actor_failure)?;
        local.scheduler.fire(&key);

        match local.registry.dispatch_wake(&key).await.map_err(actor_failure)? {
            ProcessOutcome::Processed(result) => {
                let message = result
                    .content
                    .clone()
                    .or_else(|| result.error.clone())
                    .unwrap_or_default();
                let data = json!({
                    "conversation_key": key.as_str(),
                    "trace_id": receipt.trace_id.to_string(),
                    "result": result,
                    "progress": local.sink.progress_updates().into_iter().map(|(_, text)| text).collect::<Vec<_>>(),
                });
                if result.success {
                    Ok((message, Some(data)))
                } else {
                    Err(("agent_failure", message, EXIT_AGENT))
                }
            }
            outcome => Err((
                "agent_failure",
                format!("conversation `{key}` did not process the message ({outcome:?})"),
                EXIT_AGENT,
            )),
        }
    })
}

pub fn history(key: &str) -> CommandResult {
    with_registry("history", key, |local, key| async move {
        let messages = local.registry.history(&key).await.map_err(actor_failure)?;
        let message = format!("{} message(s) in `{key}`", messages.len());
        let data = json!({ "conversation_key": key.as_str(), "messages": messages });
        Ok((message, Some(data)))
    })
}

pub fn clear(key: &str) -> CommandResult {
    with_registry("clear", key, |local, key| async move {
        local.registry.clear_history(&key).await.map_err(actor_failure)?;
        Ok((format!("history cleared for `{key}`"), None))
    })
}

fn with_registry<F, Fut>(command: &'static str, raw_key: &str, body: F) -> CommandResult
where
    F: FnOnce(LocalRuntime, ConversationKey) -> Fut,
    Fut: std::future::Future<
        Output = Result<(String, Option<serde_json::Value>), Failure>,
    >,
{
    let key = match ConversationKey::parse(raw_key) {
        Ok(key) => key,
        Err(error) => {
            return CommandResult::failure(command, "invalid_input", error.to_string(), EXIT_INPUT)
        }
    };
    let config = match load_config(command) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let local = open_local_runtime(&config).await?;
        body(local, key).await
    });

    match result {
        Ok((message, data)) => CommandResult::success_with_data(command, message, data),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

async fn open_local_runtime(config: &AppConfig) -> Result<LocalRuntime, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;

    let llm = provider_from_config(&config.llm)
        .map_err(|error| ("llm_provider", error.to_string(), EXIT_AGENT))?;
    let sink = RecordingChatSink::default();
    let scheduler = ManualWakeScheduler::default();
    let responder = responder_from_config(
        config,
        llm,
        Arc::new(ToolRegistry::with_builtin_tools()),
        Arc::new(sink.clone()),
    );

    let scheduler_handle: Arc<dyn WakeScheduler> = Arc::new(scheduler.clone());
    let registry = ActorRegistry::new(Arc::new(ActorEnvironment {
        store: Arc::new(SqlConversationStore::new(pool)),
        scheduler: scheduler_handle,
        responder: Arc::new(responder),
        sink: Arc::new(sink.clone()),
        audit: Arc::new(TracingAuditSink),
        settings: ActorSettings::from_config(config),
    }));

    Ok(LocalRuntime { registry, scheduler, sink })
}

fn actor_failure(error: ActorError) -> Failure {
    match error {
        ActorError::Domain(error) => ("invalid_input", error.to_string(), EXIT_INPUT),
        ActorError::Store(error) => ("store", error.to_string(), EXIT_STORE),
    }
}
