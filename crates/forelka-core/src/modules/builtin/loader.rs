use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    commands::{Capability, Command, CommandContext, CommandTable},
    formatting::{code, escape_html},
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
};

pub struct LoaderModule;

#[async_trait]
impl Module for LoaderModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Load and manage modules")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("load", name, load)
                .description("Load a module from the module directories")
                .usage("load <module_name>")
                .require(Capability::Owner),
        );
        table.register(
            Command::new("unload", name, unload)
                .description("Unload a module")
                .usage("unload <module_name>")
                .require(Capability::Owner),
        );
        table.register(
            Command::new("reload", name, reload)
                .description("Unload and reload every module")
                .usage("reload")
                .require(Capability::Owner),
        );
        table.register(
            Command::new("modules", name, modules)
                .description("List loaded modules")
                .usage("modules")
                .require(Capability::Owner),
        );
        Ok(())
    }
}

async fn load(ctx: CommandContext) -> anyhow::Result<()> {
    let Some(name) = ctx.arg(0).map(str::to_lowercase) else {
        ctx.reply("❌ <b>Usage:</b> <code>load &lt;module_name&gt;</code>")
            .await?;
        return Ok(());
    };
    let registry = ctx.host.modules();
    if registry.is_loaded(&name).await {
        ctx.reply(&format!("❌ <b>Module</b> {} <b>is already loaded</b>", code(&name)))
            .await?;
        return Ok(());
    }

    match registry.load_by_name(&ctx.host, &name).await {
        Ok(meta) => {
            ctx.reply(&format!(
                "✅ <b>Loaded module:</b> {} v{}\n<b>Commands:</b> {}",
                code(&meta.name),
                escape_html(&meta.version),
                escape_html(&meta.commands.join(", ")),
            ))
            .await?;
        }
        Err(e) => {
            ctx.reply(&format!(
                "❌ <b>Failed to load</b> {}: {}",
                code(&name),
                escape_html(&e.to_string())
            ))
            .await?;
        }
    }
    Ok(())
}

async fn unload(ctx: CommandContext) -> anyhow::Result<()> {
    let Some(name) = ctx.arg(0).map(str::to_lowercase) else {
        ctx.reply("❌ <b>Usage:</b> <code>unload &lt;module_name&gt;</code>")
            .await?;
        return Ok(());
    };
    if ctx.host.modules().unload(&ctx.host, &name).await {
        ctx.reply(&format!("✅ <b>Unloaded module:</b> {}", code(&name)))
            .await?;
    } else {
        ctx.reply(&format!("❌ <b>Module</b> {} <b>is not loaded</b>", code(&name)))
            .await?;
    }
    Ok(())
}

async fn reload(ctx: CommandContext) -> anyhow::Result<()> {
    ctx.reply("🔄 <b>Reloading modules...</b>").await?;
    let count = ctx.host.modules().reload_all(&ctx.host).await;
    ctx.reply(&format!("✅ <b>Reloaded</b> {count} modules"))
        .await?;
    Ok(())
}

async fn modules(ctx: CommandContext) -> anyhow::Result<()> {
    let all = ctx.host.modules().all_metadata().await;
    if all.is_empty() {
        ctx.reply("📦 <b>No modules loaded</b>").await?;
        return Ok(());
    }
    let lines: Vec<String> = all
        .iter()
        .map(|m| {
            format!(
                "• <b>{}</b> v{} by {}: {}",
                escape_html(&m.name),
                escape_html(&m.version),
                escape_html(&m.developer),
                escape_html(&m.commands.join(", ")),
            )
        })
        .collect();
    ctx.reply(&format!(
        "📦 <b>Loaded modules</b> ({})\n\n{}",
        all.len(),
        lines.join("\n")
    ))
    .await?;
    Ok(())
}
