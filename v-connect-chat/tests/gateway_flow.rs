//! 网关端到端流程测试 / Gateway end-to-end flow tests

mod common;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use common::{count, find, sign_in_again, signed_in, Client, Shared};

/// 首条消息：发送方回执、接收方推送、未读计数与已读游标
/// First message: sender ack, receiver push, unread count and read cursor
#[tokio::test]
async fn test_direct_message_round_trip() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    alice.drain();
    bob.drain();

    alice
        .send(
            &gw,
            "chatMessage",
            json!({"receiver": "200", "message": "hello", "clientMessageId": "m1"}),
        )
        .await;

    let sent = alice.drain();
    let ack = find(&sent, "chatMessageSuccess").expect("ack");
    let message_id = ack.data["id"].as_str().unwrap().to_string();
    let conversation_id = ack.data["conversationId"].as_str().unwrap().to_string();
    assert_eq!(ack.data["text"], "hello");
    assert_eq!(ack.data["senderPhone"], "100");
    assert_eq!(ack.data["isDuplicate"], false);

    let received = bob.drain();
    let pushed = find(&received, "newMessage").expect("newMessage");
    assert_eq!(pushed.data["id"], message_id.as_str());
    let note = find(&received, "newNotification").expect("notification");
    assert_eq!(note.data["preview"], "hello");
    assert_eq!(note.data["sender"], "100");

    let unread = gw
        .services
        .messages
        .unread_count(&conversation_id, &bob.user_id())
        .await?;
    assert_eq!(unread, 1);

    bob.send(
        &gw,
        "markRead",
        json!({"conversationId": conversation_id, "messageId": message_id}),
    )
    .await;
    let read = bob.drain();
    let ack = find(&read, "markReadSuccess").expect("markReadSuccess");
    assert_eq!(ack.data["unreadCount"], 0);
    assert_eq!(ack.data["advanced"], true);
    let notified = alice.drain();
    assert_eq!(find(&notified, "messagesRead").unwrap().data["userId"], bob.user_id().as_str());
    Ok(())
}

/// 相同 clientMessageId 只持久化与推送一次 / Same clientMessageId persists and fans out once
#[tokio::test]
async fn test_duplicate_client_message_id_is_idempotent() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    alice.drain();
    bob.drain();

    let frame = json!({"receiver": "200", "message": "once", "clientMessageId": "dup-1"});
    alice.send(&gw, "chatMessage", frame.clone()).await;
    alice.send(&gw, "chatMessage", frame).await;

    let acks: Vec<_> = alice
        .drain()
        .into_iter()
        .filter(|e| e.event == "chatMessageSuccess")
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].data["id"], acks[1].data["id"]);
    assert_eq!(acks[1].data["isDuplicate"], true);
    assert_eq!(count(&bob.drain(), "newMessage"), 1);
    Ok(())
}

/// 窗口内第 11 条消息被限流 / The 11th message inside one window is rate limited
#[tokio::test(start_paused = true)]
async fn test_message_rate_limit() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let _bob = signed_in(&gw, "200", "bob").await;
    alice.drain();

    for i in 0..11 {
        alice
            .send(&gw, "chatMessage", json!({"receiver": "200", "message": format!("n{}", i)}))
            .await;
    }
    let events = alice.drain();
    assert_eq!(count(&events, "chatMessageSuccess"), 10);
    let err = find(&events, "chatMessageError").expect("rate limited");
    assert_eq!(err.data["code"], "RATE_LIMITED");

    // 新窗口恢复 / A fresh window admits again
    tokio::time::advance(Duration::from_millis(1100)).await;
    alice
        .send(&gw, "chatMessage", json!({"receiver": "200", "message": "again"}))
        .await;
    assert_eq!(count(&alice.drain(), "chatMessageSuccess"), 1);
    Ok(())
}

/// 多连接在线引用计数 / Presence stays online until the last connection closes
#[tokio::test]
async fn test_presence_with_two_connections() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut observer = signed_in(&gw, "900", "observer").await;
    let c1 = signed_in(&gw, "100", "alice").await;
    let c2 = sign_in_again(&gw, "100", "alice").await;
    let alice_id = c1.user_id();
    assert_eq!(c1.user_id(), c2.user_id());
    assert_eq!(
        gw.services.presence.get_user_connections(&alice_id).await.len(),
        2
    );
    observer.drain();

    gw.disconnect(&c1.conn.id).await;
    assert!(gw.services.presence.is_online(&alice_id).await);
    assert!(find(&observer.drain(), "userOffline").is_none());

    gw.disconnect(&c2.conn.id).await;
    assert!(!gw.services.presence.is_online(&alice_id).await);
    let events = observer.drain();
    let offline = find(&events, "userOffline").expect("userOffline");
    assert_eq!(offline.data["userId"], alice_id.as_str());
    assert_eq!(offline.data["phoneNumber"], "100");
    Ok(())
}

#[tokio::test]
async fn test_operations_require_authentication() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut anon = Client::open(&gw);
    anon.drain();

    anon.send(&gw, "getConversations", json!({})).await;
    anon.send(&gw, "typing", json!({"conversationId": "c"})).await;
    let events = anon.drain();
    assert_eq!(
        find(&events, "getConversationsError").unwrap().data["code"],
        "NOT_AUTHENTICATED"
    );
    assert_eq!(find(&events, "typingError").unwrap().data["code"], "NOT_AUTHENTICATED");
    Ok(())
}

/// 输入状态过期 / Typing indicator expires after its TTL
#[tokio::test(start_paused = true)]
async fn test_typing_expires() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    alice
        .send(&gw, "chatMessage", json!({"receiver": "200", "message": "hi"}))
        .await;
    let conversation_id = find(&alice.drain(), "chatMessageSuccess").unwrap().data["conversationId"]
        .as_str()
        .unwrap()
        .to_string();
    bob.drain();

    alice.send(&gw, "typing", json!({"conversationId": conversation_id})).await;
    let typing = bob.drain();
    assert_eq!(find(&typing, "typing").unwrap().data["userId"], alice.user_id().as_str());
    // 不回执 / no acknowledgement
    assert!(alice.drain().is_empty());
    assert!(gw.services.typing.is_typing(&conversation_id, &alice.user_id()).await);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!gw.services.typing.is_typing(&conversation_id, &alice.user_id()).await);
    Ok(())
}

/// 群组创建、群消息与退群 / Group creation, group messaging and leaving
#[tokio::test]
async fn test_group_lifecycle() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    let mut carol = signed_in(&gw, "300", "carol").await;
    alice.drain();
    bob.drain();
    carol.drain();

    alice
        .send(
            &gw,
            "createGroup",
            json!({"title": "team", "participantIds": [bob.user_id(), carol.user_id()]}),
        )
        .await;
    let created = alice.drain();
    let conversation = &find(&created, "createGroupSuccess").expect("created").data["conversation"];
    let conversation_id = conversation["id"].as_str().unwrap().to_string();
    assert!(find(&bob.drain(), "conversationUpdated").is_some());
    carol.drain();

    bob.send(
        &gw,
        "chatMessage",
        json!({"conversationId": conversation_id, "message": "hey team"}),
    )
    .await;
    assert!(find(&bob.drain(), "chatMessageSuccess").is_some());
    assert_eq!(count(&alice.drain(), "newMessage"), 1);
    assert_eq!(count(&carol.drain(), "newMessage"), 1);

    carol.send(&gw, "leaveGroup", json!({"conversationId": conversation_id})).await;
    assert!(find(&carol.drain(), "leaveGroupSuccess").is_some());
    carol
        .send(
            &gw,
            "chatMessage",
            json!({"conversationId": conversation_id, "message": "still here?"}),
        )
        .await;
    assert!(find(&carol.drain(), "chatMessageError").is_some());
    Ok(())
}

/// 历史消息：仅能读取自己的会话 / History is only readable by participants
#[tokio::test]
async fn test_get_chat_messages() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    for text in ["one", "two", "three"] {
        alice
            .send(&gw, "chatMessage", json!({"receiver": "200", "message": text}))
            .await;
    }
    alice.drain();

    bob.drain();
    bob.send(&gw, "getChatMessages", json!({"friendPhoneNumber": "100"})).await;
    let events = bob.drain();
    let history = find(&events, "getChatMessagesSuccess").expect("history");
    let texts: Vec<&str> = history
        .data
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts.len(), 3);
    assert!(texts.contains(&"one") && texts.contains(&"three"));

    // 以消息为锚点翻页 / Page from a message anchor
    let first_id = history
        .data
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["text"] == "one")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    bob.send(
        &gw,
        "getChatMessages",
        json!({"friendPhoneNumber": "100", "afterMessageId": first_id}),
    )
    .await;
    let events = bob.drain();
    let newer = find(&events, "getChatMessagesSuccess").expect("newer page");
    let texts: Vec<&str> = newer
        .data
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts.len(), 2);
    assert!(!texts.contains(&"one"));

    bob.send(
        &gw,
        "getChatMessages",
        json!({"userPhoneNumber": "100", "friendPhoneNumber": "200"}),
    )
    .await;
    assert_eq!(
        find(&bob.drain(), "getChatMessagesError").unwrap().data["code"],
        "FORBIDDEN"
    );
    Ok(())
}

/// 静音会话不计入总未读 / Muted conversations drop out of the total unread count
#[tokio::test]
async fn test_mute_and_total_unread() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    let mut carol = signed_in(&gw, "300", "carol").await;
    alice.drain();
    carol.drain();

    alice
        .send(&gw, "chatMessage", json!({"receiver": "200", "message": "hi"}))
        .await;
    let conversation_id = find(&alice.drain(), "chatMessageSuccess").unwrap().data["conversationId"]
        .as_str()
        .unwrap()
        .to_string();
    bob.drain();

    bob.send(&gw, "getTotalUnread", json!({})).await;
    assert_eq!(find(&bob.drain(), "getTotalUnreadSuccess").unwrap().data["totalUnread"], 1);

    bob.send(&gw, "muteConversation", json!({"conversationId": conversation_id})).await;
    let muted = find(&bob.drain(), "muteConversationSuccess").expect("muted").data.clone();
    assert_eq!(muted["isMuted"], true);
    assert!(muted["mutedUntil"].is_null());
    bob.send(&gw, "getTotalUnread", json!({})).await;
    assert_eq!(find(&bob.drain(), "getTotalUnreadSuccess").unwrap().data["totalUnread"], 0);

    bob.send(&gw, "unmuteConversation", json!({"conversationId": conversation_id})).await;
    assert_eq!(
        find(&bob.drain(), "unmuteConversationSuccess").unwrap().data["isMuted"],
        false
    );
    bob.send(&gw, "getTotalUnread", json!({})).await;
    assert_eq!(find(&bob.drain(), "getTotalUnreadSuccess").unwrap().data["totalUnread"], 1);

    // 非参与者不能静音 / Outsiders cannot mute
    carol
        .send(&gw, "muteConversation", json!({"conversationId": conversation_id}))
        .await;
    assert_eq!(
        find(&carol.drain(), "muteConversationError").unwrap().data["code"],
        "FORBIDDEN"
    );
    Ok(())
}

/// 用户搜索返回 searchFriendResult / User search answers with searchFriendResult
#[tokio::test]
async fn test_search_users() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let _bob = signed_in(&gw, "200", "bob").await;
    alice.drain();

    alice.send(&gw, "searchUsers", json!({"query": "BO"})).await;
    let result = find(&alice.drain(), "searchFriendResult").expect("result").data.clone();
    assert_eq!(result["exists"], true);
    let hits = result["results"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["phoneNumber"], "200");
    assert_eq!(hits[0]["isOnline"], true);

    // 不返回自己 / The caller is never listed
    alice.send(&gw, "searchUsers", json!({"searchTerm": "alice"})).await;
    let result = find(&alice.drain(), "searchFriendResult").expect("result").data.clone();
    assert_eq!(result["exists"], false);

    alice.send(&gw, "searchUsers", json!({"query": "  "})).await;
    assert_eq!(
        find(&alice.drain(), "searchUsersError").unwrap().data["code"],
        "VALIDATION_ERROR"
    );
    Ok(())
}

/// 通话信令 / Call signalling between two online users
#[tokio::test]
async fn test_call_flow() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let mut bob = signed_in(&gw, "200", "bob").await;
    alice.drain();
    bob.drain();

    alice.send(&gw, "call", json!({"receiver": "200"})).await;
    let initiated = alice.drain();
    let call_id = find(&initiated, "callInitiated").expect("initiated").data["callId"]
        .as_str()
        .unwrap()
        .to_string();
    let incoming = bob.drain();
    let ring = find(&incoming, "incomingCall").expect("incomingCall");
    assert_eq!(ring.data["callId"], call_id.as_str());
    assert_eq!(ring.data["caller"]["socketId"], alice.conn.id.as_str());

    bob.send(&gw, "answer", json!({"caller": "100", "callId": call_id})).await;
    assert!(find(&bob.drain(), "callConnected").is_some());
    assert!(find(&alice.drain(), "callAccepted").is_some());

    bob.send(
        &gw,
        "offer",
        json!({"targetSocketId": alice.conn.id, "sdp": "v=0"}),
    )
    .await;
    let relayed = alice.drain();
    let offer = find(&relayed, "offer").expect("offer relayed");
    assert_eq!(offer.data["sdp"], "v=0");
    assert_eq!(offer.data["from"], bob.conn.id.as_str());

    alice
        .send(
            &gw,
            "hangUp",
            json!({"callId": call_id, "caller": "100", "receiver": "200"}),
        )
        .await;
    assert_eq!(
        find(&bob.drain(), "callEnded").unwrap().data["endedBy"],
        alice.user_id().as_str()
    );

    alice.send(&gw, "call", json!({"receiver": "999"})).await;
    assert!(find(&alice.drain(), "callError").is_some());
    Ok(())
}

#[tokio::test]
async fn test_sign_out_closes_connection() -> Result<()> {
    let shared = Shared::new();
    let gw = shared.node("node-a");
    let mut alice = signed_in(&gw, "100", "alice").await;
    let alice_id = alice.user_id();
    alice.send(&gw, "signOut", json!({})).await;
    assert!(find(&alice.drain(), "signOutSuccess").is_some());
    assert!(alice.conn.is_closed());
    assert!(gw.connection(&alice.conn.id).is_none());
    assert!(!gw.services.presence.is_online(&alice_id).await);
    Ok(())
}
