//! Minimal fire-and-forget push: outcomes are discarded, the pipeline
//! drains on stop.
//!
//! ```sh
//! cargo run --example fire_and_forget -- AuthKey_ABC123DEFG.p8 ABC123DEFG DEF123GHIJ \
//!     com.example.Alert 00fc13adff785122b4ad28809a3420982341241421348097878e577c991de8f0
//! ```

use std::sync::Arc;

use apns_client::{
    gateway, Aps, CallbackChoice, Client, ClientConfig, CommsConfig, Header, JwtSigner,
    Notification, Payload, ProcConfig, SignerChoice,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(key_path), Some(key_id), Some(team_id), Some(topic), Some(token)) = (
        args.next(),
        args.next(),
        args.next(),
        args.next(),
        args.next(),
    ) else {
        eprintln!("usage: fire_and_forget <key.p8> <key-id> <team-id> <topic> <device-token>");
        std::process::exit(2);
    };

    let signing_key = apns_keys::signing_key_from_p8_file(&key_path)?;
    let client = Client::new(ClientConfig {
        gateway: gateway::DEVELOPMENT.into(),
        comms: CommsConfig::FAST,
        proc: ProcConfig::MIN_BLOCKING,
        signer: SignerChoice::Jwt(Arc::new(JwtSigner::new(key_id, team_id, signing_key))),
        ..ClientConfig::default()
    });
    client.start().await?;

    let header = Arc::new(Header::new(topic));
    let payload = Arc::new(Payload::aps(Aps::alert("Ping!")));
    let notification = Notification::new(token, header, payload);
    client
        .push(notification, SignerChoice::Default, None, CallbackChoice::None)
        .await?;

    // Soft shutdown delivers everything accepted above.
    client.stop().await?;
    Ok(())
}
