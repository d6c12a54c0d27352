//! Gateway command handlers. Every handler validates before mutating,
//! persists before broadcasting, and reports failures as a scoped `error`
//! event to the originating connection only.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::parse_timestamp;
use parley_db::queries::{self, ThreadReplyOutcome};
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

pub const MAX_CONTENT_LEN: usize = 4000;

/// Identity and per-connection state shared with the send task.
pub struct ConnCtx {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub joined: Arc<std::sync::RwLock<HashSet<i64>>>,
}

impl ConnCtx {
    fn is_joined(&self, room_id: i64) -> bool {
        self.joined
            .read()
            .expect("joined set lock poisoned")
            .contains(&room_id)
    }
}

pub async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled during the handshake

        GatewayCommand::JoinRoom { room_id } => {
            join_room(dispatcher, db, ctx, room_id).await;
        }

        GatewayCommand::LeaveRoom { room_id } => {
            ctx.joined
                .write()
                .expect("joined set lock poisoned")
                .remove(&room_id);
            dispatcher.leave_room(ctx.conn_id, room_id).await;
            // Idempotent: acknowledged whether or not the room was joined
            dispatcher
                .send_to_conn(ctx.conn_id, GatewayEvent::LeftRoom { room_id })
                .await;
        }

        GatewayCommand::SendMessage {
            room_id,
            content,
            local_id,
        } => {
            send_message(dispatcher, db, ctx, room_id, content, local_id).await;
        }

        GatewayCommand::EditMessage {
            message_id,
            content,
        } => {
            edit_message(dispatcher, db, ctx, message_id, content).await;
        }

        GatewayCommand::DeleteMessage { message_id } => {
            delete_message(dispatcher, db, ctx, message_id).await;
        }

        GatewayCommand::AddReaction { message_id, emoji } => {
            toggle_reaction(dispatcher, db, ctx, message_id, emoji, true).await;
        }

        GatewayCommand::RemoveReaction { message_id, emoji } => {
            toggle_reaction(dispatcher, db, ctx, message_id, emoji, false).await;
        }

        GatewayCommand::CreateThreadReply {
            parent_message_id,
            content,
            local_id,
        } => {
            create_thread_reply(dispatcher, db, ctx, parent_message_id, content, local_id).await;
        }

        GatewayCommand::StartTyping { room_id } => {
            set_typing(dispatcher, ctx, room_id, true).await;
        }

        GatewayCommand::StopTyping { room_id } => {
            set_typing(dispatcher, ctx, room_id, false).await;
        }
    }
}

async fn scoped_error(dispatcher: &Dispatcher, conn_id: Uuid, message: impl Into<String>) {
    dispatcher
        .send_to_conn(
            conn_id,
            GatewayEvent::Error {
                message: message.into(),
            },
        )
        .await;
}

fn validate_content(content: &str) -> Result<(), &'static str> {
    if content.trim().is_empty() {
        return Err("content must not be empty");
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err("content too long (max 4000 characters)");
    }
    Ok(())
}

async fn join_room(dispatcher: &Dispatcher, db: &Arc<Database>, ctx: &ConnCtx, room_id: i64) {
    let db = db.clone();
    let user_id = ctx.user_id.to_string();
    let verdict = tokio::task::spawn_blocking(move || -> anyhow::Result<(bool, bool)> {
        let exists = db.room_exists(room_id)?;
        let allowed = exists && db.can_access(&user_id, room_id)?;
        Ok((exists, allowed))
    })
    .await;

    let (exists, allowed) = match verdict {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            error!("join-room membership check failed: {}", e);
            return scoped_error(dispatcher, ctx.conn_id, "internal error").await;
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            return scoped_error(dispatcher, ctx.conn_id, "internal error").await;
        }
    };

    if !exists {
        return scoped_error(dispatcher, ctx.conn_id, "room not found").await;
    }
    if !allowed {
        return scoped_error(dispatcher, ctx.conn_id, "access denied").await;
    }

    ctx.joined
        .write()
        .expect("joined set lock poisoned")
        .insert(room_id);
    dispatcher.join_room(ctx.conn_id, room_id).await;
    info!("{} joined room {}", ctx.username, room_id);
    dispatcher
        .send_to_conn(ctx.conn_id, GatewayEvent::JoinedRoom { room_id })
        .await;
}

async fn send_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    room_id: i64,
    content: String,
    local_id: Option<String>,
) {
    if let Err(msg) = validate_content(&content) {
        return scoped_error(dispatcher, ctx.conn_id, msg).await;
    }
    if !ctx.is_joined(room_id) {
        return scoped_error(dispatcher, ctx.conn_id, "join the room before sending").await;
    }

    // Membership can change between join and send: re-verify at the point
    // of persistence. The broadcast goes out while the store lock is still
    // held, so frame order on the fabric matches insert order even when
    // sends from different connections race.
    let db = db.clone();
    let broadcaster = dispatcher.clone();
    let user_id = ctx.user_id.to_string();
    let conn_id = ctx.conn_id;
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        db.with_conn(|conn| {
            if !queries::query_can_access(conn, &user_id, room_id)? {
                return Ok(false);
            }
            let row = queries::insert_message_row(conn, room_id, &user_id, &content)?;
            broadcaster.broadcast_created(row.into_message(vec![]), conn_id, local_id);
            Ok(true)
        })
    })
    .await;

    match flatten(result) {
        Ok(true) => {}
        Ok(false) => scoped_error(dispatcher, ctx.conn_id, "access denied").await,
        Err(e) => {
            error!("send-message persist failed: {}", e);
            scoped_error(dispatcher, ctx.conn_id, "failed to send message").await;
        }
    }
}

enum MutateOutcome {
    Done { room_id: i64, edited_at: String },
    NotFound,
    NotAuthor,
    Deleted,
}

async fn edit_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    message_id: i64,
    content: String,
) {
    if let Err(msg) = validate_content(&content) {
        return scoped_error(dispatcher, ctx.conn_id, msg).await;
    }

    let db = db.clone();
    let user_id = ctx.user_id.to_string();
    let edited = content.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<MutateOutcome> {
        let msg = match db.get_message(message_id)? {
            Some(m) => m,
            None => return Ok(MutateOutcome::NotFound),
        };
        if msg.author_id != user_id {
            return Ok(MutateOutcome::NotAuthor);
        }
        if msg.is_deleted {
            return Ok(MutateOutcome::Deleted);
        }
        let edited_at = db.edit_message(message_id, &edited)?;
        Ok(MutateOutcome::Done {
            room_id: msg.room_id,
            edited_at,
        })
    })
    .await;

    match flatten(result) {
        Ok(MutateOutcome::Done { room_id, edited_at }) => {
            dispatcher.broadcast(GatewayEvent::MessageUpdated {
                id: message_id,
                room_id,
                content,
                is_edited: true,
                edited_at: parse_timestamp(&edited_at, "edit broadcast"),
            });
        }
        Ok(MutateOutcome::NotFound) => {
            scoped_error(dispatcher, ctx.conn_id, "message not found").await
        }
        Ok(MutateOutcome::NotAuthor) => {
            scoped_error(dispatcher, ctx.conn_id, "only the author can edit a message").await
        }
        Ok(MutateOutcome::Deleted) => {
            scoped_error(dispatcher, ctx.conn_id, "message was deleted").await
        }
        Err(e) => {
            error!("edit-message failed: {}", e);
            scoped_error(dispatcher, ctx.conn_id, "failed to edit message").await;
        }
    }
}

async fn delete_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    message_id: i64,
) {
    let db = db.clone();
    let user_id = ctx.user_id.to_string();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<MutateOutcome> {
        let msg = match db.get_message(message_id)? {
            Some(m) => m,
            None => return Ok(MutateOutcome::NotFound),
        };
        if msg.author_id != user_id {
            return Ok(MutateOutcome::NotAuthor);
        }
        db.soft_delete_message(message_id)?;
        Ok(MutateOutcome::Done {
            room_id: msg.room_id,
            edited_at: String::new(),
        })
    })
    .await;

    match flatten(result) {
        Ok(MutateOutcome::Done { room_id, .. }) => {
            dispatcher.broadcast(GatewayEvent::MessageDeleted {
                id: message_id,
                room_id,
            });
        }
        Ok(MutateOutcome::NotFound) => {
            scoped_error(dispatcher, ctx.conn_id, "message not found").await
        }
        Ok(MutateOutcome::NotAuthor) => {
            scoped_error(dispatcher, ctx.conn_id, "only the author can delete a message").await
        }
        Ok(MutateOutcome::Deleted) => {} // already deleted: nothing to do
        Err(e) => {
            error!("delete-message failed: {}", e);
            scoped_error(dispatcher, ctx.conn_id, "failed to delete message").await;
        }
    }
}

enum ReactOutcome {
    Changed { room_id: i64, count: usize },
    NoChange,
    NotFound,
    Forbidden,
}

async fn toggle_reaction(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    message_id: i64,
    emoji: String,
    add: bool,
) {
    if emoji.is_empty() || emoji.len() > 32 {
        return scoped_error(dispatcher, ctx.conn_id, "invalid emoji").await;
    }

    let db = db.clone();
    let user_id = ctx.user_id.to_string();
    let reaction_emoji = emoji.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<ReactOutcome> {
        let msg = match db.get_message(message_id)? {
            Some(m) => m,
            None => return Ok(ReactOutcome::NotFound),
        };
        if !db.can_access(&user_id, msg.room_id)? {
            return Ok(ReactOutcome::Forbidden);
        }
        let count = if add {
            let reaction_id = Uuid::new_v4().to_string();
            db.add_reaction(&reaction_id, message_id, &user_id, &reaction_emoji)?
        } else {
            db.remove_reaction(message_id, &user_id, &reaction_emoji)?
        };
        Ok(match count {
            Some(count) => ReactOutcome::Changed {
                room_id: msg.room_id,
                count,
            },
            None => ReactOutcome::NoChange,
        })
    })
    .await;

    match flatten(result) {
        Ok(ReactOutcome::Changed { room_id, count }) => {
            let event = if add {
                GatewayEvent::ReactionAdded {
                    message_id,
                    room_id,
                    emoji,
                    user_id: ctx.user_id,
                    username: ctx.username.clone(),
                    count,
                }
            } else {
                GatewayEvent::ReactionRemoved {
                    message_id,
                    room_id,
                    emoji,
                    user_id: ctx.user_id,
                    count,
                }
            };
            dispatcher.broadcast(event);
        }
        // Toggle no-op (already added / already absent): nothing to broadcast
        Ok(ReactOutcome::NoChange) => {}
        Ok(ReactOutcome::NotFound) => {
            scoped_error(dispatcher, ctx.conn_id, "message not found").await
        }
        Ok(ReactOutcome::Forbidden) => {
            scoped_error(dispatcher, ctx.conn_id, "access denied").await
        }
        Err(e) => {
            error!("reaction toggle failed: {}", e);
            scoped_error(dispatcher, ctx.conn_id, "failed to update reaction").await;
        }
    }
}

enum ReplyVerdict {
    Created,
    NotFound,
    NotRoot,
    Forbidden,
}

async fn create_thread_reply(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    ctx: &ConnCtx,
    parent_id: i64,
    content: String,
    local_id: Option<String>,
) {
    if let Err(msg) = validate_content(&content) {
        return scoped_error(dispatcher, ctx.conn_id, msg).await;
    }

    let db = db.clone();
    let broadcaster = dispatcher.clone();
    let user_id = ctx.user_id.to_string();
    let conn_id = ctx.conn_id;
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<ReplyVerdict> {
        db.with_conn_mut(|conn| {
            let parent = match queries::query_message(conn, parent_id)? {
                Some(p) => p,
                None => return Ok(ReplyVerdict::NotFound),
            };
            if !queries::query_can_access(conn, &user_id, parent.room_id)? {
                return Ok(ReplyVerdict::Forbidden);
            }
            match queries::insert_thread_reply_tx(conn, parent_id, &user_id, &content)? {
                ThreadReplyOutcome::Created { reply, summary } => {
                    // Reply broadcast and the summary event go out under
                    // the store lock, in insert order. The summary event is
                    // separate so clients not viewing the thread can update
                    // reply counts on the root message.
                    broadcaster.broadcast_created(reply.into_message(vec![]), conn_id, local_id);
                    broadcaster.broadcast(GatewayEvent::ThreadSummaryUpdated {
                        parent_id: summary.parent_id,
                        room_id: summary.room_id,
                        thread_reply_count: summary.reply_count,
                        thread_last_replied_at: parse_timestamp(
                            &summary.last_reply_at,
                            "thread summary broadcast",
                        ),
                        thread_last_replied_by: summary.last_reply_by,
                    });
                    Ok(ReplyVerdict::Created)
                }
                ThreadReplyOutcome::ParentNotFound => Ok(ReplyVerdict::NotFound),
                ThreadReplyOutcome::ParentIsReply => Ok(ReplyVerdict::NotRoot),
            }
        })
    })
    .await;

    match flatten(result) {
        Ok(ReplyVerdict::Created) => {}
        Ok(ReplyVerdict::NotFound) => {
            scoped_error(dispatcher, ctx.conn_id, "thread parent not found").await
        }
        Ok(ReplyVerdict::NotRoot) => {
            scoped_error(dispatcher, ctx.conn_id, "cannot reply to a thread reply").await
        }
        Ok(ReplyVerdict::Forbidden) => {
            scoped_error(dispatcher, ctx.conn_id, "access denied").await
        }
        Err(e) => {
            error!("create-thread-reply failed: {}", e);
            scoped_error(dispatcher, ctx.conn_id, "failed to post reply").await;
        }
    }
}

async fn set_typing(dispatcher: &Dispatcher, ctx: &ConnCtx, room_id: i64, is_typing: bool) {
    if !ctx.is_joined(room_id) {
        return scoped_error(dispatcher, ctx.conn_id, "join the room first").await;
    }

    let changed = dispatcher
        .set_typing(room_id, ctx.user_id, &ctx.username, is_typing)
        .await;
    if changed {
        dispatcher.broadcast(GatewayEvent::TypingChanged {
            room_id,
            user_id: ctx.user_id,
            username: ctx.username.clone(),
            is_typing,
        });
    }
}

fn flatten<T>(
    result: Result<anyhow::Result<T>, tokio::task::JoinError>,
) -> anyhow::Result<T> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(anyhow::anyhow!("spawn_blocking join error: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Outbound;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dispatcher: Dispatcher,
        db: Arc<Database>,
        ctx: ConnCtx,
        conn_rx: UnboundedReceiver<GatewayEvent>,
    }

    async fn harness(username: &str) -> Harness {
        let dispatcher = Dispatcher::new();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user_id = Uuid::new_v4();
        db.create_user(&user_id.to_string(), username, "hash").unwrap();

        let (conn_id, conn_rx) = dispatcher.register(user_id, username.to_string()).await;
        dispatcher.user_online(user_id, username.to_string()).await;
        let ctx = ConnCtx {
            conn_id,
            user_id,
            username: username.to_string(),
            joined: Arc::new(std::sync::RwLock::new(HashSet::new())),
        };
        Harness {
            dispatcher,
            db,
            ctx,
            conn_rx,
        }
    }

    async fn second_conn(h: &Harness, username: &str) -> (ConnCtx, UnboundedReceiver<GatewayEvent>) {
        let user_id = Uuid::new_v4();
        h.db.create_user(&user_id.to_string(), username, "hash").unwrap();
        let (conn_id, conn_rx) = h.dispatcher.register(user_id, username.to_string()).await;
        h.dispatcher.user_online(user_id, username.to_string()).await;
        let ctx = ConnCtx {
            conn_id,
            user_id,
            username: username.to_string(),
            joined: Arc::new(std::sync::RwLock::new(HashSet::new())),
        };
        (ctx, conn_rx)
    }

    fn next_broadcast(rx: &mut tokio::sync::broadcast::Receiver<Outbound>) -> Outbound {
        match rx.try_recv() {
            Ok(out) => out,
            Err(e) => panic!("expected broadcast, got {:?}", e),
        }
    }

    fn expect_scoped_error(rx: &mut UnboundedReceiver<GatewayEvent>) -> String {
        match rx.try_recv() {
            Ok(GatewayEvent::Error { message }) => message,
            other => panic!("expected scoped error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_message_persists_then_broadcasts_with_echo() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::JoinRoom { room_id: 1 },
        )
        .await;
        assert!(matches!(
            h.conn_rx.try_recv(),
            Ok(GatewayEvent::JoinedRoom { room_id: 1 })
        ));

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::SendMessage {
                room_id: 1,
                content: "hello".into(),
                local_id: Some("tok123".into()),
            },
        )
        .await;

        let out = next_broadcast(&mut rx);
        assert_eq!(out.room_id, Some(1));

        // Persisted before broadcast
        let message_id = match &out.event {
            GatewayEvent::MessageCreated { message, local_id } => {
                assert_eq!(local_id, &None);
                assert_eq!(message.content, "hello");
                message.id
            }
            other => panic!("unexpected event: {:?}", other),
        };
        assert!(h.db.get_message(message_id).unwrap().is_some());

        // local_id echoed only on the originating connection's copy
        let joined: HashSet<i64> = [1].into_iter().collect();
        match out.deliverable(h.ctx.conn_id, &joined) {
            Some(GatewayEvent::MessageCreated { local_id, .. }) => {
                assert_eq!(local_id.as_deref(), Some("tok123"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        match out.deliverable(Uuid::new_v4(), &joined) {
            Some(GatewayEvent::MessageCreated { local_id, .. }) => assert_eq!(local_id, None),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn interleaved_sends_broadcast_in_store_order() {
        let mut h = harness("ada").await;
        let (ctx_b, mut rx_b) = second_conn(&h, "grace").await;

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::JoinRoom { room_id: 1 },
        )
        .await;
        handle_command(
            &h.dispatcher,
            &h.db,
            &ctx_b,
            GatewayCommand::JoinRoom { room_id: 1 },
        )
        .await;
        h.conn_rx.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        let mut rx = h.dispatcher.subscribe();

        // Two connections racing sends: broadcast order must match the
        // order the store assigned ids, regardless of task scheduling.
        let send_a = async {
            for i in 0..5 {
                handle_command(
                    &h.dispatcher,
                    &h.db,
                    &h.ctx,
                    GatewayCommand::SendMessage {
                        room_id: 1,
                        content: format!("a{i}"),
                        local_id: None,
                    },
                )
                .await;
            }
        };
        let send_b = async {
            for i in 0..5 {
                handle_command(
                    &h.dispatcher,
                    &h.db,
                    &ctx_b,
                    GatewayCommand::SendMessage {
                        room_id: 1,
                        content: format!("b{i}"),
                        local_id: None,
                    },
                )
                .await;
            }
        };
        tokio::join!(send_a, send_b);

        let mut ids = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let GatewayEvent::MessageCreated { message, .. } = out.event {
                ids.push(message.id);
            }
        }
        assert_eq!(ids.len(), 10);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn send_without_join_is_a_scoped_error() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::SendMessage {
                room_id: 1,
                content: "hello".into(),
                local_id: None,
            },
        )
        .await;

        expect_scoped_error(&mut h.conn_rx);
        // Never broadcast on validation failure
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn empty_content_is_rejected_before_persist() {
        let mut h = harness("ada").await;
        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::JoinRoom { room_id: 1 },
        )
        .await;
        h.conn_rx.try_recv().unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::SendMessage {
                room_id: 1,
                content: "   ".into(),
                local_id: None,
            },
        )
        .await;
        assert!(expect_scoped_error(&mut h.conn_rx).contains("empty"));
    }

    #[tokio::test]
    async fn edit_by_non_author_is_forbidden() {
        let mut h = harness("ada").await;
        let other = Uuid::new_v4();
        h.db.create_user(&other.to_string(), "grace", "hash").unwrap();
        let msg = h.db.insert_message(1, &other.to_string(), "hers").unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::EditMessage {
                message_id: msg.id,
                content: "mine now".into(),
            },
        )
        .await;

        assert!(expect_scoped_error(&mut h.conn_rx).contains("author"));
        let unchanged = h.db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(unchanged.content, "hers");
    }

    #[tokio::test]
    async fn delete_broadcasts_targeted_event() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();
        let msg = h
            .db
            .insert_message(1, &h.ctx.user_id.to_string(), "bye")
            .unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::DeleteMessage { message_id: msg.id },
        )
        .await;

        match next_broadcast(&mut rx).event {
            GatewayEvent::MessageDeleted { id, room_id } => {
                assert_eq!(id, msg.id);
                assert_eq!(room_id, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.db.get_message(msg.id).unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn reply_to_reply_is_rejected() {
        let mut h = harness("ada").await;
        let author = h.ctx.user_id.to_string();
        let root = h.db.insert_message(1, &author, "root").unwrap();
        let reply = match h.db.insert_thread_reply(root.id, &author, "r1").unwrap() {
            ThreadReplyOutcome::Created { reply, .. } => reply,
            _ => panic!("expected Created"),
        };

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::CreateThreadReply {
                parent_message_id: reply.id,
                content: "nested".into(),
                local_id: None,
            },
        )
        .await;

        assert!(expect_scoped_error(&mut h.conn_rx).contains("reply"));
    }

    #[tokio::test]
    async fn thread_reply_emits_summary_update() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();
        let root = h
            .db
            .insert_message(1, &h.ctx.user_id.to_string(), "root")
            .unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::CreateThreadReply {
                parent_message_id: root.id,
                content: "first reply".into(),
                local_id: None,
            },
        )
        .await;

        match next_broadcast(&mut rx).event {
            GatewayEvent::MessageCreated { message, .. } => {
                assert_eq!(message.parent_message_id, Some(root.id));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_broadcast(&mut rx).event {
            GatewayEvent::ThreadSummaryUpdated {
                parent_id,
                thread_reply_count,
                thread_last_replied_by,
                ..
            } => {
                assert_eq!(parent_id, root.id);
                assert_eq!(thread_reply_count, 1);
                assert_eq!(thread_last_replied_by, "ada");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reaction_add_then_remove_round_trips() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();
        let msg = h
            .db
            .insert_message(1, &h.ctx.user_id.to_string(), "react to me")
            .unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::AddReaction {
                message_id: msg.id,
                emoji: "🎉".into(),
            },
        )
        .await;
        match next_broadcast(&mut rx).event {
            GatewayEvent::ReactionAdded { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        // Duplicate add: no event
        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::AddReaction {
                message_id: msg.id,
                emoji: "🎉".into(),
            },
        )
        .await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::RemoveReaction {
                message_id: msg.id,
                emoji: "🎉".into(),
            },
        )
        .await;
        match next_broadcast(&mut rx).event {
            GatewayEvent::ReactionRemoved { count, .. } => assert_eq!(count, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn reaction_on_inaccessible_message_is_access_denied() {
        let mut h = harness("ada").await;
        let owner = Uuid::new_v4();
        h.db.create_user(&owner.to_string(), "grace", "hash").unwrap();
        let room = h
            .db
            .create_room("ops", "private", "", &owner.to_string())
            .unwrap()
            .unwrap();
        let msg = h
            .db
            .insert_message(room.id, &owner.to_string(), "secret")
            .unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::AddReaction {
                message_id: msg.id,
                emoji: "👀".into(),
            },
        )
        .await;

        // Existing message in a private room: denied, not "not found"
        assert!(expect_scoped_error(&mut h.conn_rx).contains("access denied"));
    }

    #[tokio::test]
    async fn typing_requires_join_and_broadcasts_changes() {
        let mut h = harness("ada").await;
        let mut rx = h.dispatcher.subscribe();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::StartTyping { room_id: 1 },
        )
        .await;
        expect_scoped_error(&mut h.conn_rx);

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::JoinRoom { room_id: 1 },
        )
        .await;
        h.conn_rx.try_recv().unwrap();

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::StartTyping { room_id: 1 },
        )
        .await;
        match next_broadcast(&mut rx).event {
            GatewayEvent::TypingChanged { is_typing, .. } => assert!(is_typing),
            other => panic!("unexpected event: {:?}", other),
        }

        handle_command(
            &h.dispatcher,
            &h.db,
            &h.ctx,
            GatewayCommand::StopTyping { room_id: 1 },
        )
        .await;
        match next_broadcast(&mut rx).event {
            GatewayEvent::TypingChanged { is_typing, .. } => assert!(!is_typing),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
