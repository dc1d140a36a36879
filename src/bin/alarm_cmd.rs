use alarm_server::auth::current_user;
use alarm_server::broker::{MessageLog, MqttConfig, MqttLog};
use alarm_server::protocol::{encode, AlarmCommand, CommandMessage, MessageKey, TopicNames};
use anyhow::{bail, Context};
use tokio::time::{sleep, Duration, Instant};

fn usage(program: &str) -> ! {
    println!("Usage: {} <config> <path> <command> [seconds]", program);
    println!("Commands: ack, unack, enable, disable, shelve <seconds>, unshelve");
    println!("Example: {} Accelerator /Accelerator/Vacuum ack", program);
    println!("Broker from ALARM_MQTT_HOST / ALARM_MQTT_PORT, default localhost:1883");
    std::process::exit(1);
}

fn parse_command(args: &[String]) -> anyhow::Result<AlarmCommand> {
    let command = match args[3].as_str() {
        "ack" | "acknowledge" => AlarmCommand::Acknowledge,
        "unack" | "unacknowledge" => AlarmCommand::Unacknowledge,
        "enable" => AlarmCommand::Enable,
        "disable" => AlarmCommand::Disable,
        "shelve" => {
            let seconds = args
                .get(4)
                .context("shelve needs a duration in seconds")?
                .parse()
                .context("invalid shelving duration")?;
            AlarmCommand::Shelve {
                duration_secs: seconds,
            }
        }
        "unshelve" => AlarmCommand::Unshelve,
        other => bail!("unknown command '{}'", other),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        usage(&args[0]);
    }

    let topics = TopicNames::new(&args[1]);
    let path = args[2].clone();
    let message = CommandMessage {
        user: current_user(),
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        command: parse_command(&args)?,
    };

    let mut config = MqttConfig::default();
    if let Ok(host) = std::env::var("ALARM_MQTT_HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("ALARM_MQTT_PORT") {
        config.port = port.parse().context("invalid ALARM_MQTT_PORT")?;
    }

    let log = MqttLog::connect(&config);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !log.is_connected() {
        if Instant::now() > deadline {
            bail!("cannot connect to {}:{}", config.host, config.port);
        }
        sleep(Duration::from_millis(50)).await;
    }

    let key = MessageKey::Command(path).to_string();
    log.send(&topics.command, &key, Some(encode(&message)?))
        .await
        .context("publishing command")?;
    println!("Sent {:?} as {}@{} to {}", message.command, message.user, message.host, key);

    // Let the event loop flush the publish
    sleep(Duration::from_millis(500)).await;
    log.shutdown();
    Ok(())
}
