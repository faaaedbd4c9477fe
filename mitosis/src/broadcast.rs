//! Per-task event fan-out.
//!
//! Each transport connection gets its own bounded queue and a set of joined
//! rooms (`task_{task_id}`). `publish` delivers only to connections that
//! joined the event's room, never blocks, and never fails the caller.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::BroadcastError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskProgress,
    StepCompleted,
    TaskCompleted,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskProgress => "task_progress",
            EventType::StepCompleted => "step_completed",
            EventType::TaskCompleted => "task_completed",
            EventType::Error => "error",
        }
    }
}

/// Wire shape of a state-transition notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: EventType,
    pub task_id: String,
    pub room: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

pub fn room_name(task_id: &str) -> String {
    format!("task_{task_id}")
}

/// A registered connection and the queue its events arrive on.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<TaskEvent>,
}

struct Connection {
    sender: mpsc::Sender<TaskEvent>,
    rooms: HashSet<String>,
}

pub struct EventBroadcaster {
    connections: RwLock<HashMap<u64, Connection>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBroadcaster {
    /// `buffer` is the per-connection queue length.
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn connect(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::channel(self.buffer);
        self.write().insert(
            id,
            Connection {
                sender,
                rooms: HashSet::new(),
            },
        );
        debug!(connection = id, "event connection opened");
        Subscription { id, events }
    }

    /// Join the room of `task_id`. A connection may join any number of rooms.
    pub fn subscribe(&self, connection: u64, task_id: &str) -> Result<(), BroadcastError> {
        let mut connections = self.write();
        let conn = connections
            .get_mut(&connection)
            .ok_or(BroadcastError::ConnectionClosed(connection))?;
        conn.rooms.insert(room_name(task_id));
        debug!(connection, task_id, "joined task room");
        Ok(())
    }

    /// Leave the room of `task_id`. Returns false if the connection was not in it.
    pub fn unsubscribe(&self, connection: u64, task_id: &str) -> Result<bool, BroadcastError> {
        let mut connections = self.write();
        let conn = connections
            .get_mut(&connection)
            .ok_or(BroadcastError::ConnectionClosed(connection))?;
        Ok(conn.rooms.remove(&room_name(task_id)))
    }

    /// Drop a connection and all its room memberships.
    pub fn disconnect(&self, connection: u64) {
        if self.write().remove(&connection).is_some() {
            debug!(connection, "event connection closed");
        }
    }

    /// Deliver an event to every connection in the task's room.
    ///
    /// Returns the number of connections the event was queued for. Full
    /// queues drop the event for that connection; closed ones are removed.
    pub fn publish(&self, task_id: &str, event: EventType, data: Value) -> usize {
        let room = room_name(task_id);
        let payload = TaskEvent {
            event,
            task_id: task_id.to_string(),
            room: room.clone(),
            data,
            timestamp: Utc::now(),
        };

        let mut delivered = 0usize;
        let mut closed = Vec::new();
        {
            let connections = self.read();
            for (id, conn) in connections.iter() {
                if !conn.rooms.contains(&room) {
                    continue;
                }
                match conn.sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(connection = id, task_id, event = event.as_str(), "event queue full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut connections = self.write();
            for id in closed {
                connections.remove(&id);
            }
        }
        debug!(task_id, event = event.as_str(), delivered, "event published");
        delivered
    }

    /// Connections currently in the task's room.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        let room = room_name(task_id);
        self.read()
            .values()
            .filter(|conn| conn.rooms.contains(&room))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Connection>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(sub: &mut Subscription) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn events_reach_only_their_room() {
        let bus = EventBroadcaster::new(8);
        let mut a = bus.connect();
        let mut b = bus.connect();
        bus.subscribe(a.id, "A").expect("join");
        bus.subscribe(b.id, "B").expect("join");

        bus.publish("A", EventType::TaskProgress, json!({"step": 1}));
        bus.publish("B", EventType::StepCompleted, json!({}));
        bus.publish("A", EventType::TaskCompleted, json!({}));

        let for_a = drain(&mut a);
        let for_b = drain(&mut b);
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|e| e.task_id == "A" && e.room == "task_A"));
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].task_id, "B");
    }

    #[test]
    fn one_connection_may_join_many_rooms() {
        let bus = EventBroadcaster::new(8);
        let mut conn = bus.connect();
        bus.subscribe(conn.id, "A").expect("join");
        bus.subscribe(conn.id, "B").expect("join");

        bus.publish("A", EventType::TaskProgress, Value::Null);
        bus.publish("B", EventType::TaskProgress, Value::Null);
        bus.publish("C", EventType::TaskProgress, Value::Null);

        assert_eq!(drain(&mut conn).len(), 2);
    }

    #[test]
    fn unsubscribe_and_disconnect_stop_delivery() {
        let bus = EventBroadcaster::new(8);
        let mut conn = bus.connect();
        bus.subscribe(conn.id, "A").expect("join");
        assert!(bus.unsubscribe(conn.id, "A").expect("leave"));
        assert_eq!(bus.publish("A", EventType::Error, Value::Null), 0);

        bus.subscribe(conn.id, "A").expect("join");
        bus.disconnect(conn.id);
        assert_eq!(bus.publish("A", EventType::Error, Value::Null), 0);
        assert!(drain(&mut conn).is_empty());
        assert!(matches!(
            bus.subscribe(conn.id, "A"),
            Err(BroadcastError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let bus = EventBroadcaster::new(1);
        let conn = bus.connect();
        bus.subscribe(conn.id, "A").expect("join");
        assert_eq!(bus.publish("A", EventType::TaskProgress, Value::Null), 1);
        assert_eq!(bus.publish("A", EventType::TaskProgress, Value::Null), 0);
        assert_eq!(bus.subscriber_count("A"), 1);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBroadcaster::new(4);
        let conn = bus.connect();
        bus.subscribe(conn.id, "A").expect("join");
        drop(conn);
        assert_eq!(bus.publish("A", EventType::TaskProgress, Value::Null), 0);
        assert_eq!(bus.connection_count(), 0);
    }

    #[test]
    fn event_serializes_with_snake_case_name() {
        let event = TaskEvent {
            event: EventType::StepCompleted,
            task_id: "t1".to_string(),
            room: room_name("t1"),
            data: Value::Null,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "step_completed");
        assert_eq!(json["room"], "task_t1");
    }
}
