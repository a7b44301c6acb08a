use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::{Capability, Command, CommandContext, CommandTable},
    domain::UserId,
    formatting::code,
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
};

pub struct OwnerModule;

#[async_trait]
impl Module for OwnerModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Manage account owners and permissions")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("owner", name, owner)
                .description("List owners, or add/remove one")
                .usage("owner [user_id|reply]")
                .require(Capability::Owner),
        );
        table.register(
            Command::new("admin", name, admin)
                .description("Grant admin permissions")
                .usage("admin <user_id|reply>")
                .require(Capability::Owner),
        );
        Ok(())
    }
}

/// Reply author first, then the first argument.
fn target_user(ctx: &CommandContext) -> Option<UserId> {
    ctx.message
        .reply_to_sender
        .or_else(|| ctx.arg(0)?.parse::<i64>().ok().map(UserId))
}

async fn owner(ctx: CommandContext) -> anyhow::Result<()> {
    let repo = ctx.host.repo();
    let account_id = ctx.account_id();

    if ctx.args.is_empty() && ctx.message.reply_to_sender.is_none() {
        let owners = ctx.session.owners(repo.as_ref()).await?;
        if owners.is_empty() {
            ctx.reply("❌ <b>No owners configured for this account</b>")
                .await?;
            return Ok(());
        }
        let lines: Vec<String> = owners
            .iter()
            .map(|o| {
                let tag = if o.is_admin { " (admin)" } else { "" };
                format!("• {}{tag}", code(&o.owner_user_id.to_string()))
            })
            .collect();
        ctx.reply(&format!(
            "👑 <b>Account Owners</b>\n<b>Account:</b> {}\n\n{}",
            code(&ctx.session.me().to_string()),
            lines.join("\n")
        ))
        .await?;
        return Ok(());
    }

    let Some(target) = target_user(&ctx) else {
        ctx.reply("❌ <b>Invalid user ID or reply required</b>").await?;
        return Ok(());
    };
    if target == ctx.session.me() {
        ctx.reply("❌ <b>You cannot modify your own owner status</b>")
            .await?;
        return Ok(());
    }

    if repo.is_owner(account_id, target).await? {
        repo.remove_owner(account_id, target).await?;
        ctx.reply(&format!("✅ <b>Removed owner:</b> {}", code(&target.to_string())))
            .await?;
    } else {
        repo.add_owner(account_id, target, false).await?;
        ctx.reply(&format!("✅ <b>Added owner:</b> {}", code(&target.to_string())))
            .await?;
    }
    Ok(())
}

async fn admin(ctx: CommandContext) -> anyhow::Result<()> {
    let Some(target) = target_user(&ctx) else {
        ctx.reply("❌ <b>Usage:</b> <code>admin &lt;user_id|reply&gt;</code>")
            .await?;
        return Ok(());
    };
    if target == ctx.session.me() {
        ctx.reply("❌ <b>You cannot modify your own owner status</b>")
            .await?;
        return Ok(());
    }
    ctx.host
        .repo()
        .add_owner(ctx.account_id(), target, true)
        .await?;
    ctx.reply(&format!(
        "✅ <b>Granted admin permissions to:</b> {}",
        code(&target.to_string())
    ))
    .await?;
    Ok(())
}
