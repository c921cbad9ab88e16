// These need a running RabbitMQ and the AMQP_* variables (or a .env file).

use rabbit_rpc::config::ClientSettings;
use rabbit_rpc::env::BrokerConfig;
use rabbit_rpc::rabbitmq::{AmqpBroker, Broker, CallOptions, RpcClient};
use serde_json::json;
use std::sync::Arc;

fn load_test_config() -> BrokerConfig {
    BrokerConfig::load().expect("AMQP_EXCHANGE and ROUTING_KEY must be set")
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let config = load_test_config();
    let broker = AmqpBroker::from_config(&config);

    let session = broker.acquire().await.expect("Failed to open a session");
    drop(session);
    broker.close().await.expect("Failed to close connections");
}

#[tokio::test]
#[ignore]
async fn test_fire_and_forget_publish() {
    let config = load_test_config();
    let broker = Arc::new(AmqpBroker::from_config(&config));
    let settings = ClientSettings::from_env(&config, "live_test", "live_test_response");
    let mut client = RpcClient::new(broker.clone(), settings);

    let result = client
        .call(&json!({"ping": true}), CallOptions::fire_and_forget())
        .await
        .expect("Publish failed");
    assert!(result.is_none());
    broker.close().await.expect("Failed to close connections");
}

#[tokio::test]
#[ignore]
async fn test_unanswered_call_times_out() {
    let mut config = load_test_config();
    config.timeout_secs = 1;
    let broker = Arc::new(AmqpBroker::from_config(&config));
    let settings = ClientSettings::from_env(&config, "live_test", "live_test_unanswered");
    let mut client = RpcClient::new(broker.clone(), settings);

    let err = client
        .call(&json!({"ping": true}), CallOptions::default().routing_key("nobody.listens"))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}
