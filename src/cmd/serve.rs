//! API server command: `autoctf serve`.

use anyhow::Result;
use autoctf::app::App;
use autoctf::config::AppConfig;

pub async fn cmd_serve(mut config: AppConfig, host: Option<String>, port: Option<u16>, cors: bool) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.server.cors |= cors;

    let app = App::build(config)?;
    autoctf::server::serve(app).await
}
