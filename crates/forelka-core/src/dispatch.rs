//! Per-message command pipeline.
//!
//! prefix check -> tokenize -> alias resolve -> lookup -> permission -> execute.
//! Nothing here returns an error to the caller: every failure ends as a
//! [`DispatchOutcome`] so the receive loop keeps running.

use std::{any::Any, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    commands::{Capability, Command, CommandContext, Permission},
    domain::Prefix,
    formatting::code,
    host::Host,
    session::Session,
    transport::{IncomingMessage, TextFormat},
    utils::truncate_text,
};

const MAX_ERROR_TEXT: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Case-folded command token.
    pub name: String,
    pub args: Vec<String>,
}

/// Split `"<prefix><name> <args...>"`. `None` when the prefix is missing or
/// nothing follows it.
pub fn parse_command(text: &str, prefix: &Prefix) -> Option<ParsedCommand> {
    let rest = text.strip_prefix(prefix.as_str())?.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("").to_lowercase();
    if name.is_empty() {
        return None;
    }
    let args = parts
        .next()
        .map(|a| a.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    Some(ParsedCommand { name, args })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    NoText,
    NoPrefix,
    EmptyCommand,
    UnknownCommand,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Discarded(DiscardReason),
    Denied { command: String },
    Completed { command: String },
    Failed { command: String, error: String },
}

pub async fn dispatch(
    host: &Arc<Host>,
    session: &Arc<Session>,
    message: IncomingMessage,
) -> DispatchOutcome {
    let account_id = session.account_id();
    let Some(text) = message.text.as_deref() else {
        return DispatchOutcome::Discarded(DiscardReason::NoText);
    };

    let prefix = match session.prefix(host.repo().as_ref()).await {
        Ok(p) => p,
        Err(e) => {
            warn!(%account_id, error = %e, "failed to read prefix, using account default");
            session.account().prefix.clone()
        }
    };
    if !text.starts_with(prefix.as_str()) {
        return DispatchOutcome::Discarded(DiscardReason::NoPrefix);
    }
    let Some(parsed) = parse_command(text, &prefix) else {
        return DispatchOutcome::Discarded(DiscardReason::EmptyCommand);
    };

    let Some(command) = host.commands().resolve_for(account_id, &parsed.name) else {
        debug!(%account_id, token = %parsed.name, "unknown command");
        return DispatchOutcome::Discarded(DiscardReason::UnknownCommand);
    };
    let name = command.name().to_string();

    let permission = host
        .commands()
        .check_permission(&command, account_id, message.sender_id)
        .await;
    let denied = match permission {
        Ok(Permission::Allowed) => None,
        Ok(Permission::Denied(cap)) => Some(cap),
        Err(e) => {
            warn!(%account_id, command = %name, error = %e, "permission check failed, denying");
            command.required().iter().next().copied()
        }
    };
    if let Some(cap) = denied {
        info!(%account_id, command = %name, sender = ?message.sender_id, "access denied");
        send_notice(session, &message, &denied_notice(cap)).await;
        return DispatchOutcome::Denied { command: name };
    }

    execute(host, session, message, command, parsed.args).await
}

async fn execute(
    host: &Arc<Host>,
    session: &Arc<Session>,
    message: IncomingMessage,
    command: Arc<Command>,
    args: Vec<String>,
) -> DispatchOutcome {
    let account_id = session.account_id();
    let name = command.name().to_string();
    let module = command.module().to_string();
    let handler = command.handler();
    let ctx = CommandContext {
        host: host.clone(),
        session: session.clone(),
        message: message.clone(),
        command,
        args,
    };

    // Run on its own task so a panic is contained; awaiting keeps per-account order.
    let joined = tokio::spawn(async move { handler.call(ctx).await }).await;
    let error = match joined {
        Ok(Ok(())) => return DispatchOutcome::Completed { command: name },
        Ok(Err(e)) => {
            error!(%account_id, command = %name, %module, error = ?e, "command failed");
            format!("{e:#}")
        }
        Err(join) if join.is_panic() => {
            let text = panic_text(join.into_panic());
            error!(%account_id, command = %name, %module, panic = %text, "command panicked");
            text
        }
        Err(join) => {
            error!(%account_id, command = %name, %module, error = %join, "command task aborted");
            join.to_string()
        }
    };

    send_notice(session, &message, &error_notice(&name, &error, &module)).await;
    DispatchOutcome::Failed {
        command: name,
        error,
    }
}

async fn send_notice(session: &Session, message: &IncomingMessage, html: &str) {
    if let Err(e) = session
        .transport()
        .send(message.chat_id, html, TextFormat::Html)
        .await
    {
        warn!(account_id = %session.account_id(), error = %e, "failed to send notice");
    }
}

fn denied_notice(cap: Capability) -> String {
    let who = match cap {
        Capability::Owner => "account owners",
        Capability::Admin => "admins",
    };
    format!("❌ <b>Access denied</b>\nThis command is only available to {who}.")
}

pub fn error_notice(command: &str, error: &str, module: &str) -> String {
    format!(
        "❌ <b>Command Error</b>\n<b>Command:</b> {}\n<b>Error:</b> {}\n<b>Module:</b> {}",
        code(command),
        code(&truncate_text(error, MAX_ERROR_TEXT)),
        code(module),
    )
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return format!("panic: {s}");
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return format!("panic: {s}");
    }
    "panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::UserId,
        repository::PREFIX_SETTING,
        testing::{fixture, text_from},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn prefix(p: &str) -> Prefix {
        Prefix::parse(p).unwrap()
    }

    #[test]
    fn parses_name_and_args() {
        let p = prefix(".");
        assert_eq!(
            parse_command(".PING foo  bar", &p),
            Some(ParsedCommand {
                name: "ping".into(),
                args: vec!["foo".into(), "bar".into()]
            })
        );
        assert_eq!(parse_command(".ping", &p).unwrap().args, Vec::<String>::new());
        assert_eq!(parse_command(".  help me", &p).unwrap().name, "help");
        assert_eq!(parse_command("ping", &p), None);
        assert_eq!(parse_command(".", &p), None);
        assert_eq!(parse_command(".   ", &p), None);
        assert_eq!(parse_command("!!x", &prefix("!!")).unwrap().name, "x");
    }

    fn recording(
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    ) -> impl Fn(CommandContext) -> std::future::Ready<anyhow::Result<()>> + Send + Sync {
        move |ctx: CommandContext| {
            calls.lock().unwrap().push(ctx.args.clone());
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn concrete_ping_scenario() {
        let fx = fixture().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        fx.host
            .commands()
            .register(Command::new("ping", "ping", recording(calls.clone())));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".ping")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "ping".into() });

        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".PING foo bar")).await;

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, "ping")).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::NoPrefix));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".unknown")).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::UnknownCommand));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Vec::<String>::new(), vec!["foo".to_string(), "bar".to_string()]]
        );
        assert!(fx.transport.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn message_without_text_is_discarded() {
        let fx = fixture().await;
        let mut msg = text_from(fx.owner, ".ping");
        msg.text = None;
        let out = dispatch(&fx.host, &fx.session, msg).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::NoText));
    }

    #[tokio::test]
    async fn handler_error_is_reported_and_session_keeps_working() {
        let fx = fixture().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        fx.host.commands().register(Command::new(
            "ping",
            "ping",
            move |_ctx: CommandContext| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        anyhow::bail!("boom <1>");
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
        ));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".ping")).await;
        assert!(matches!(out, DispatchOutcome::Failed { ref command, .. } if command == "ping"));

        let sent = fx.transport.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("<code>ping</code>"));
        assert!(sent[0].contains("boom &lt;1&gt;"));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".ping")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "ping".into() });
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let fx = fixture().await;
        fx.host.commands().register(Command::new(
            "explode",
            "dev",
            |ctx: CommandContext| async move {
                if ctx.args.is_empty() {
                    panic!("kaboom");
                }
                Ok::<(), anyhow::Error>(())
            },
        ));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".explode")).await;
        match out {
            DispatchOutcome::Failed { command, error } => {
                assert_eq!(command, "explode");
                assert!(error.contains("kaboom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(fx.transport.sent_texts().len(), 1);
    }

    #[tokio::test]
    async fn owner_only_denies_non_owner_with_one_notice() {
        let fx = fixture().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        fx.host.commands().register(
            Command::new("secret", "owner", recording(calls.clone())).require(Capability::Owner),
        );

        let out = dispatch(&fx.host, &fx.session, text_from(UserId(777), ".secret")).await;
        assert_eq!(out, DispatchOutcome::Denied { command: "secret".into() });
        assert!(calls.lock().unwrap().is_empty());
        let sent = fx.transport.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Access denied"));

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".secret")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "secret".into() });
    }

    #[tokio::test]
    async fn alias_dispatches_target_until_target_removed() {
        let fx = fixture().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        fx.host
            .commands()
            .register(Command::new("ping", "ping", recording(calls.clone())));
        fx.host.commands().register_alias("P", "ping");

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".p")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "ping".into() });

        fx.host.commands().unregister("ping");
        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".p")).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::UnknownCommand));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prefix_change_applies_to_the_next_message() {
        let fx = fixture().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        fx.host
            .commands()
            .register(Command::new("ping", "ping", recording(calls.clone())));

        fx.host
            .repo()
            .set_setting(fx.session.account_id(), PREFIX_SETTING, "!")
            .await
            .unwrap();

        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".ping")).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::NoPrefix));
        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, "!ping")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "ping".into() });
    }

    #[test]
    fn error_notice_escapes_and_names_module() {
        let notice = error_notice("ping", "a<b", "net");
        assert!(notice.contains("<code>a&lt;b</code>"));
        assert!(notice.contains("<code>net</code>"));
    }
}
