//! PostgreSQL 存储集成测试（需设置 DATABASE_URL）
//! PostgreSQL store integration tests, skipped unless DATABASE_URL is set

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use anyhow::Result;
use serde_json::json;

use common::{find, Client};
use v_connect_chat::cluster::Directory;
use v_connect_chat::config::ChatConfig;
use v_connect_chat::coord::MemoryCoordStore;
use v_connect_chat::domain::{Conversation, Message, MessagePosition, MessageQuery, MessageType};
use v_connect_chat::gateway::ChatGateway;
use v_connect_chat::service::{LocalMediaStore, NoopPublisher, Services};
use v_connect_chat::storage::postgres::SCHEMA;
use v_connect_chat::storage::{PgStore, Stores};

async fn postgres_gateway(media_dir: &tempfile::TempDir) -> Result<Option<ChatGateway>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("⏭️  DATABASE_URL not set, skipping / 跳过");
        return Ok(None);
    };
    let pool = sqlx::PgPool::connect(&url).await?;
    v::apply_schema(&pool, SCHEMA).await?;
    let mut cfg = ChatConfig::default();
    cfg.media.dir = media_dir.path().to_string_lossy().to_string();
    cfg.auth.kdf_memory_kib = 1024;
    cfg.auth.kdf_iterations = 1;
    let services = Services::new(
        &cfg,
        Stores::postgres(PgStore::new(pool)),
        Arc::new(MemoryCoordStore::new()),
        Arc::new(LocalMediaStore::new(&cfg.media)),
        Arc::new(NoopPublisher),
    );
    Ok(Some(ChatGateway::new(
        Arc::new(cfg),
        services,
        Arc::new(Directory::new()),
    )))
}

fn unique_phone() -> String {
    let n = uuid::Uuid::new_v4().as_u128() % 1_000_000_000_000;
    format!("+1{:012}", n)
}

#[tokio::test]
async fn test_postgres_message_flow() -> Result<()> {
    let media_dir = tempfile::tempdir()?;
    let Some(gw) = postgres_gateway(&media_dir).await? else {
        return Ok(());
    };
    let (phone_a, phone_b) = (unique_phone(), unique_phone());

    let mut alice = Client::open(&gw);
    let mut bob = Client::open(&gw);
    for (client, phone, name) in [(&alice, &phone_a, "alice"), (&bob, &phone_b, "bob")] {
        let creds = json!({"phoneNumber": phone, "username": name, "passcode": "secret"});
        client.send(&gw, "register", creds.clone()).await;
        client.send(&gw, "signIn", creds).await;
    }
    assert!(find(&alice.drain(), "signInSuccess").is_some());
    bob.drain();

    let frame = json!({"receiver": phone_b, "message": "stored", "clientMessageId": "pg-1"});
    alice.send(&gw, "chatMessage", frame.clone()).await;
    alice.send(&gw, "chatMessage", frame).await;
    let acks: Vec<_> = alice
        .drain()
        .into_iter()
        .filter(|e| e.event == "chatMessageSuccess")
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].data["id"], acks[1].data["id"]);
    let conversation_id = acks[0].data["conversationId"].as_str().unwrap().to_string();
    let message_id = acks[0].data["id"].as_str().unwrap().to_string();

    assert_eq!(
        gw.services
            .messages
            .unread_count(&conversation_id, &bob.user_id())
            .await?,
        1
    );
    bob.send(
        &gw,
        "markRead",
        json!({"conversationId": conversation_id, "messageId": message_id}),
    )
    .await;
    let read = bob.drain();
    assert_eq!(find(&read, "markReadSuccess").unwrap().data["unreadCount"], 0);

    // 游标不回退 / The cursor never moves backwards
    bob.send(
        &gw,
        "markRead",
        json!({"conversationId": conversation_id, "messageId": message_id}),
    )
    .await;
    assert_eq!(find(&bob.drain(), "markReadSuccess").unwrap().data["advanced"], false);
    Ok(())
}

/// 同一时间戳的消息按插入序号分页与推进游标
/// Messages sharing a timestamp page and advance cursors by insertion sequence
#[tokio::test]
async fn test_postgres_cursor_ties_use_sequence() -> Result<()> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("⏭️  DATABASE_URL not set, skipping / 跳过");
        return Ok(());
    };
    let pool = sqlx::PgPool::connect(&url).await?;
    v::apply_schema(&pool, SCHEMA).await?;
    let stores = Stores::postgres(PgStore::new(pool));

    let (a, b) = (unique_phone(), unique_phone());
    let members: BTreeSet<String> = [a.clone(), b.clone()].into_iter().collect();
    let conv = Conversation::new_group(&a, members, "ties".to_string());
    stores.conversations.insert_conversation(&conv).await?;
    stores.read_states.ensure(&conv.id, &b).await?;

    let tied_at = DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0).unwrap();
    let mut stored = Vec::new();
    for i in 0..4 {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conv.id.clone(),
            sender_id: a.clone(),
            message_type: MessageType::Text,
            text: format!("tie {}", i),
            media_ref: None,
            reply_to_message_id: None,
            client_message_id: None,
            created_at: tied_at,
            edited_at: None,
            deleted_at: None,
            deleted_for_user_ids: BTreeSet::new(),
            seq: 0,
        };
        stored.push(stores.messages.insert_message(msg).await?);
    }
    assert!(stored.iter().all(|m| m.created_at == tied_at));

    let latest = stores
        .messages
        .list_messages(&conv.id, &b, &MessageQuery { limit: Some(2), ..Default::default() })
        .await?;
    let ids: Vec<&str> = latest.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![stored[2].id.as_str(), stored[3].id.as_str()]);

    let older = stores
        .messages
        .list_messages(
            &conv.id,
            &b,
            &MessageQuery {
                limit: Some(10),
                before: Some(MessagePosition::of(&latest[0])),
                after: None,
            },
        )
        .await?;
    let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![stored[0].id.as_str(), stored[1].id.as_str()]);

    let first = stores
        .read_states
        .mark_read(&conv.id, &b, &stored[1].id, MessagePosition::of(&stored[1]))
        .await?;
    assert!(first.advanced);
    let later = stores
        .read_states
        .mark_read(&conv.id, &b, &stored[3].id, MessagePosition::of(&stored[3]))
        .await?;
    assert!(later.advanced);
    assert_eq!(later.state.last_read_message_id.as_deref(), Some(stored[3].id.as_str()));
    let stale = stores
        .read_states
        .mark_read(&conv.id, &b, &stored[2].id, MessagePosition::of(&stored[2]))
        .await?;
    assert!(!stale.advanced);

    // 回显值与读回值一致 / The echoed timestamp equals the stored one
    let fresh = Message {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        text: "precise".to_string(),
        ..stored[0].clone()
    };
    let echoed = stores.messages.insert_message(fresh).await?;
    let reread = stores.messages.get_message(&echoed.id).await?.unwrap();
    assert_eq!(echoed.created_at, reread.created_at);
    assert_eq!(echoed.seq, reread.seq);
    Ok(())
}
