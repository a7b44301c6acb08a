use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    commands::{Capability, Command, CommandContext, CommandTable},
    domain::AccountId,
    formatting::code,
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
    repository::{Repository, ALIAS_SETTING_PREFIX},
};

pub struct AliasModule;

#[async_trait]
impl Module for AliasModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Manage command aliases")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("alias", name, alias)
                .description("List, create or delete command aliases")
                .usage("alias [name] [command]")
                .require(Capability::Owner),
        );
        Ok(())
    }
}

/// Re-register the aliases persisted for an account. Returns how many.
pub async fn restore_aliases(
    repo: &dyn Repository,
    table: &CommandTable,
    account_id: AccountId,
) -> crate::Result<usize> {
    let mut restored = 0;
    for (key, target) in repo.list_settings(account_id).await? {
        let Some(name) = key.strip_prefix(ALIAS_SETTING_PREFIX) else {
            continue;
        };
        if name.is_empty() || target.is_empty() {
            continue;
        }
        table.register_account_alias(account_id, name, &target);
        restored += 1;
    }
    debug!(%account_id, restored, "aliases restored");
    Ok(restored)
}

/// [`restore_aliases`] for every stored account. Per-account failures are
/// logged and skipped.
pub async fn restore_all_aliases(repo: &dyn Repository, table: &CommandTable) -> usize {
    let accounts = match repo.list_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "cannot list accounts to restore aliases");
            return 0;
        }
    };
    let mut restored = 0;
    for account in accounts {
        match restore_aliases(repo, table, account.id).await {
            Ok(n) => restored += n,
            Err(e) => warn!(account_id = %account.id, error = %e, "failed to restore aliases"),
        }
    }
    restored
}

async fn alias(ctx: CommandContext) -> anyhow::Result<()> {
    let repo = ctx.host.repo();
    let table = ctx.host.commands();
    let account_id = ctx.account_id();

    match ctx.args.as_slice() {
        [] => {
            let settings = repo.list_settings(account_id).await?;
            let lines: Vec<String> = settings
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(ALIAS_SETTING_PREFIX)
                        .map(|name| format!("• {} → {}", code(name), code(v)))
                })
                .collect();
            if lines.is_empty() {
                ctx.reply("❌ <b>No aliases configured</b>").await?;
            } else {
                ctx.reply(&format!("➡️ <b>Active Aliases</b>\n\n{}", lines.join("\n")))
                    .await?;
            }
        }
        [name] => {
            let name = name.to_lowercase();
            let key = format!("{ALIAS_SETTING_PREFIX}{name}");
            if repo.delete_setting(account_id, &key).await? {
                table.unregister_account_alias(account_id, &name);
                ctx.reply(&format!("✅ <b>Deleted alias:</b> {}", code(&name)))
                    .await?;
            } else {
                ctx.reply(&format!("❌ <b>Alias</b> {} <b>not found</b>", code(&name)))
                    .await?;
            }
        }
        [name, target, ..] => {
            let name = name.to_lowercase();
            let target = target.to_lowercase();
            if !table.contains(&target) {
                ctx.reply(&format!("❌ <b>Command</b> {} <b>not found</b>", code(&target)))
                    .await?;
                return Ok(());
            }
            let key = format!("{ALIAS_SETTING_PREFIX}{name}");
            repo.set_setting(account_id, &key, &target).await?;
            table.register_account_alias(account_id, &name, &target);
            ctx.reply(&format!(
                "✅ <b>Created alias:</b> {} → {}",
                code(&name),
                code(&target)
            ))
            .await?;
        }
    }
    Ok(())
}
