//! Tests against a running Skytable server.
//!
//! Set `SKYTABLE_ADDR` (default `127.0.0.1:2003`) and, if the server has auth
//! enabled, `SKYTABLE_USER` and `SKYTABLE_TOKEN`.

use crate::{
    AuthProvider, Connection, ConnectionConfig, ConnectionPool, Del, Get, PoolConfig,
    QueryPacket, Set, Value, PROTOCOL_VERSION,
};

fn test_config() -> ConnectionConfig {
    let addr = std::env::var("SKYTABLE_ADDR").unwrap_or_else(|_| "127.0.0.1:2003".to_string());
    let mut config = ConnectionConfig::new(addr);
    if let (Ok(user), Ok(token)) = (std::env::var("SKYTABLE_USER"), std::env::var("SKYTABLE_TOKEN")) {
        config = config.auth(AuthProvider::fixed(user, token));
    }
    config
}

#[tokio::test]
async fn test_handshake_and_heya() {
    let mut conn = Connection::open(test_config()).await.unwrap();
    assert_eq!(conn.sys_info_protocol().await.unwrap(), PROTOCOL_VERSION);
    conn.heya().await.unwrap();
}

#[tokio::test]
async fn test_pipelined_set_get_del() {
    let mut conn = Connection::open(test_config()).await.unwrap();
    conn.del(&["it_pipelined"]).await.unwrap();

    let packet = QueryPacket::new()
        .push(Set::new("it_pipelined", "v1"))
        .push(Get::new("it_pipelined"))
        .push(Del::new(["it_pipelined"]));
    let values = conn.send_and_receive(packet).await.unwrap().into_values().unwrap();

    assert_eq!(values.len(), 3);
    assert_eq!(values[1], Value::from("v1"));
    assert_eq!(values[2].as_u64(), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_round_trips() {
    let pool = ConnectionPool::connect(PoolConfig::new(test_config()).capacity(4))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("it_pool_{}", i);
            pool.del(&[&key]).await?;
            pool.set(&key, format!("v{}", i)).await?;
            let value = pool.get(&key).await?;
            pool.del(&[&key]).await?;
            Ok::<_, crate::Error>(value)
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap().unwrap();
        assert_eq!(value, Value::from(format!("v{}", i)));
    }
    assert!(pool.opened_conns() <= 4);
    pool.close().await;
}
