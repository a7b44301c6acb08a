use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::{Capability, Command, CommandContext, CommandTable},
    domain::Prefix,
    formatting::{code, escape_html},
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
    repository::PREFIX_SETTING,
};

pub struct PrefixModule;

#[async_trait]
impl Module for PrefixModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Change the command prefix of the account")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("prefix", name, prefix)
                .description("Show or change the command prefix")
                .usage("prefix [new_prefix]")
                .require(Capability::Owner),
        );
        Ok(())
    }
}

async fn prefix(ctx: CommandContext) -> anyhow::Result<()> {
    let repo = ctx.host.repo();
    let Some(raw) = ctx.arg(0) else {
        let current = ctx.session.prefix(repo.as_ref()).await?;
        ctx.reply(&format!(
            "⚙️ <b>Prefix Settings</b>\n<b>Current prefix:</b> {}\n<b>Usage:</b> {}",
            code(current.as_str()),
            code(&format!("{current}prefix [new_prefix]")),
        ))
        .await?;
        return Ok(());
    };

    let new_prefix = match Prefix::parse(raw) {
        Ok(p) => p,
        Err(e) => {
            ctx.reply(&format!("❌ <b>{}</b>", escape_html(&e.to_string())))
                .await?;
            return Ok(());
        }
    };
    repo.set_setting(ctx.account_id(), PREFIX_SETTING, new_prefix.as_str())
        .await?;
    ctx.reply(&format!(
        "✅ <b>Prefix changed to:</b> {}",
        code(new_prefix.as_str())
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        dispatch::{dispatch, DiscardReason, DispatchOutcome},
        testing::{fixture, text_from},
    };

    #[tokio::test]
    async fn prefix_change_takes_effect_immediately() {
        let fx = fixture().await;
        fx.host.modules().load_builtins(&fx.host).await;

        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".prefix !")).await;
        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".ping")).await;
        assert_eq!(out, DispatchOutcome::Discarded(DiscardReason::NoPrefix));
        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, "!prefix")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "prefix".into() });
        assert!(fx.transport.sent_texts()[1].contains("<code>!</code>"));
    }

    #[tokio::test]
    async fn invalid_prefix_is_rejected() {
        let fx = fixture().await;
        fx.host.modules().load_builtins(&fx.host).await;

        dispatch(&fx.host, &fx.session, text_from(fx.owner, ".prefix abcd")).await;
        assert!(fx.transport.sent_texts()[0].contains("invalid prefix"));
        let out = dispatch(&fx.host, &fx.session, text_from(fx.owner, ".prefix")).await;
        assert_eq!(out, DispatchOutcome::Completed { command: "prefix".into() });
    }
}
