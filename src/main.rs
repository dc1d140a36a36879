use alarm_server::broker::{LocalLog, MessageLog};
use alarm_server::config::BrokerConfig;
use alarm_server::server::default_handlers;
use alarm_server::{AlarmServer, Result, ServerConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "alarm_server=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Alarm server v{} starting", alarm_server::VERSION);

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(&path)?,
        None => {
            info!("No configuration file given, using defaults");
            ServerConfig::default()
        }
    };
    info!(
        "Configuration '{}', shelving options {:?}",
        config.config_name,
        config.shelving()
    );

    let log: Arc<dyn MessageLog> = match &config.broker {
        BrokerConfig::Local => {
            info!("Using in-process message log");
            Arc::new(LocalLog::new())
        }
        #[cfg(feature = "mqtt")]
        BrokerConfig::Mqtt(mqtt) => {
            info!("Connecting to MQTT broker {}:{}", mqtt.host, mqtt.port);
            Arc::new(alarm_server::broker::MqttLog::connect(mqtt))
        }
    };

    let handlers = default_handlers(&config);
    let server = AlarmServer::new(config, log, handlers)?;
    if let Err(e) = server.start().await {
        error!("Failed to start: {}", e);
        server.shutdown();
        return Err(e);
    }
    info!("Serving {} alarm tree items", server.tree().len());

    if let Err(e) = signal::ctrl_c().await {
        error!("Cannot wait for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    server.shutdown();

    info!("Alarm server stopped normally");
    Ok(())
}
