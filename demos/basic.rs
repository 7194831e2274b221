use std::time::Duration;

use loupe_agent::{install_panic_hook, Agent, AgentConfig, AuthHeader, MessageDraft, Severity};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loupe_agent=debug")),
        )
        .init();

    let agent = Agent::new(
        AgentConfig::new("http://localhost:3500")
            .with_auth_header(AuthHeader::new("x-loupe-key", "demo")),
    )
    .await;
    install_panic_hook(&agent);

    agent.set_session_id(Some("demo-session".into())).await;
    agent.information("Demo", "Started", "Demo application started").await;
    agent
        .write(
            MessageDraft::new(Severity::Warning, "Demo", "Slow request", "Request took {0}ms")
                .with_parameters(vec![json!(1250)])
                .with_details(json!({ "route": "/orders", "attempt": 2 })),
        )
        .await;

    let header = agent.client_session_header();
    println!("{}: {}", header.header_name, header.header_value);

    tokio::time::sleep(Duration::from_secs(2)).await;
    agent.shutdown().await;
}
