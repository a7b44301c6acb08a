use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    commands::{Command, CommandContext, CommandTable},
    formatting::code,
    host::Host,
    modules::{builtin::DEVELOPER, LoadError, Module, ModuleInfo},
    utils::format_duration,
};

pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(DEVELOPER, "1.0", "Response time and uptime")
    }

    async fn register(
        &self,
        _host: &Arc<Host>,
        table: &CommandTable,
        name: &str,
    ) -> Result<(), LoadError> {
        table.register(
            Command::new("ping", name, ping)
                .description("Check response time")
                .usage("ping"),
        );
        table.register(
            Command::new("uptime", name, uptime)
                .description("Show uptime")
                .usage("uptime"),
        );
        Ok(())
    }
}

async fn ping(ctx: CommandContext) -> anyhow::Result<()> {
    let started = Instant::now();
    ctx.reply("<b>🏓 Pinging...</b>").await?;
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    ctx.reply(&format!(
        "<b>🏓 Pong!</b>\n<b>Response time:</b> {}\n<b>Account:</b> {}",
        code(&format!("{ms:.1} ms")),
        code(&ctx.session.me().to_string()),
    ))
    .await?;
    Ok(())
}

async fn uptime(ctx: CommandContext) -> anyhow::Result<()> {
    ctx.reply(&format!(
        "<b>⏰ Uptime</b>\n<b>Session:</b> {}\n<b>Host:</b> {}\n<b>Account:</b> {}",
        code(&format_duration(ctx.session.uptime())),
        code(&format_duration(ctx.host.uptime())),
        code(&ctx.session.me().to_string()),
    ))
    .await?;
    Ok(())
}
