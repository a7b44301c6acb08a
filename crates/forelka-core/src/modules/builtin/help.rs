use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    commands::{Command, CommandContext, CommandTable},
    formatting::{bold, code, escape_html},
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
};

pub struct HelpModule;

#[async_trait]
impl Module for HelpModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Command help and search")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("help", name, help)
                .description("Show help information")
                .usage("help [command]"),
        );
        table.register(
            Command::new("search", name, search)
                .description("Search for commands")
                .usage("search <query>"),
        );
        Ok(())
    }
}

async fn help(ctx: CommandContext) -> anyhow::Result<()> {
    let repo = ctx.host.repo().clone();
    let prefix = ctx.session.prefix(repo.as_ref()).await?;
    let table = ctx.host.commands();

    let Some(wanted) = ctx.arg(0) else {
        let is_owner = match ctx.message.sender_id {
            Some(user) => repo.is_owner(ctx.account_id(), user).await?,
            None => false,
        };
        let mut by_module: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for c in table.list(!is_owner) {
            by_module
                .entry(c.module().to_string())
                .or_default()
                .push(code(&format!("{prefix}{}", c.name())));
        }
        let mut text = String::from("🤖 <b>Commands</b>\n");
        for (module, cmds) in by_module {
            text.push_str(&format!("\n{}: {}", bold(&module), cmds.join(", ")));
        }
        text.push_str(&format!(
            "\n\nUse {} for details.",
            code(&format!("{prefix}help <command>"))
        ));
        ctx.reply(&text).await?;
        return Ok(());
    };

    let Some(cmd) = table.resolve_for(ctx.account_id(), wanted) else {
        ctx.reply(&format!("❌ <b>Command</b> {} <b>not found</b>", code(wanted)))
            .await?;
        return Ok(());
    };

    let usage = if cmd.usage_text().is_empty() {
        cmd.name().to_string()
    } else {
        cmd.usage_text().to_string()
    };
    let permission = if cmd.is_owner_only() {
        "owner only"
    } else if cmd.is_admin_only() {
        "admins only"
    } else {
        "everyone"
    };
    let text = format!(
        "📖 <b>Command Help:</b> {}\n\n📝 <b>Description:</b> {}\n🎯 <b>Usage:</b> {}\n📦 <b>Module:</b> {}\n🔒 <b>Permissions:</b> {}",
        code(cmd.name()),
        escape_html(if cmd.about().is_empty() {
            "No description available"
        } else {
            cmd.about()
        }),
        code(&format!("{prefix}{usage}")),
        escape_html(cmd.module()),
        permission,
    );
    ctx.reply(&text).await?;
    Ok(())
}

async fn search(ctx: CommandContext) -> anyhow::Result<()> {
    if ctx.args.is_empty() {
        ctx.reply("❌ <b>Usage:</b> <code>search &lt;query&gt;</code>")
            .await?;
        return Ok(());
    }
    let query = ctx.args.join(" ");
    let hits = ctx.host.commands().search(&query);
    if hits.is_empty() {
        ctx.reply(&format!("🔍 No commands match {}", code(&query)))
            .await?;
        return Ok(());
    }

    let lines: Vec<String> = hits
        .iter()
        .map(|c| format!("• {} ({}) {}", code(c.name()), escape_html(c.module()), escape_html(c.about())))
        .collect();
    ctx.reply(&format!(
        "🔍 <b>Search results for</b> {}\n\n{}",
        code(&query),
        lines.join("\n")
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{dispatch::dispatch, testing::{fixture, text_from}, domain::UserId};

    #[tokio::test]
    async fn help_lists_and_describes_commands() {
        let fx = fixture().await;
        fx.host.modules().load_builtins(&fx.host).await;

        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".help")).await;
        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".help ping")).await;
        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".help nope")).await;

        let sent = fx.transport.sent_texts();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("<code>.ping</code>"));
        assert!(sent[0].contains("<code>.load</code>"));
        assert!(sent[1].contains("Command Help"));
        assert!(sent[1].contains("<code>.ping</code>"));
        assert!(sent[2].contains("not found"));
    }

    #[tokio::test]
    async fn help_hides_owner_commands_from_strangers() {
        let fx = fixture().await;
        fx.host.modules().load_builtins(&fx.host).await;

        dispatch(&fx.host, &fx.session, text_from(UserId(4242), ".help")).await;
        let sent = fx.transport.sent_texts();
        assert!(sent[0].contains("<code>.ping</code>"));
        assert!(!sent[0].contains("<code>.load</code>"));
    }

    #[tokio::test]
    async fn search_matches_description() {
        let fx = fixture().await;
        fx.host.modules().load_builtins(&fx.host).await;

        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".search uptime")).await;
        let sent = fx.transport.sent_texts();
        assert!(sent[0].contains("<code>uptime</code>"));
    }
}
