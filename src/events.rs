use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServiceResult;

/// Notification events consumed by other services. Each variant carries the
/// denormalized company display fields downstream consumers need, since they
/// have no join access to this database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum DomainEvent {
    UserInvitationSentEvent {
        invitation_id: Uuid,
        company_id: i32,
        company_name: String,
        company_domain: String,
        email: String,
        invitation_link: String,
        expires_at: OffsetDateTime,
    },
    InvitationCancelledEvent {
        invitation_id: Uuid,
        company_id: i32,
        company_name: String,
        company_domain: String,
        email: String,
        cancelled_by: i32,
        reason: String,
    },
    InvitationExpiredEvent {
        invitation_id: Uuid,
        company_id: i32,
        company_name: String,
        company_domain: String,
        email: String,
    },
    UserRegisteredEvent {
        user_id: i32,
        company_id: i32,
        company_name: String,
        company_domain: String,
        email: String,
        first_name: String,
        last_name: String,
    },
    UserLoginEvent {
        user_id: i32,
        company_id: i32,
        session_id: Uuid,
        email: String,
        device: Option<String>,
        ip_address: Option<String>,
    },
    UserPresenceChangedEvent {
        user_id: i32,
        company_id: i32,
        online: bool,
    },
    AccountConfirmedEvent {
        user_id: i32,
        company_id: i32,
        company_name: String,
        company_domain: String,
        email: String,
    },
    AccountConfirmationRequestedEvent {
        user_id: i32,
        company_id: i32,
        email: String,
        confirmation_link: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::UserInvitationSentEvent { .. } => "UserInvitationSentEvent",
            DomainEvent::InvitationCancelledEvent { .. } => "InvitationCancelledEvent",
            DomainEvent::InvitationExpiredEvent { .. } => "InvitationExpiredEvent",
            DomainEvent::UserRegisteredEvent { .. } => "UserRegisteredEvent",
            DomainEvent::UserLoginEvent { .. } => "UserLoginEvent",
            DomainEvent::UserPresenceChangedEvent { .. } => "UserPresenceChangedEvent",
            DomainEvent::AccountConfirmedEvent { .. } => "AccountConfirmedEvent",
            DomainEvent::AccountConfirmationRequestedEvent { .. } => {
                "AccountConfirmationRequestedEvent"
            }
        }
    }
}

/// Wire envelope for a published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub occurred_on: OffsetDateTime,
    #[serde(flatten)]
    pub event: DomainEvent,
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    event_id: Uuid,
    event_type: String,
    payload: String,
    occurred_on: OffsetDateTime,
}

/// Fire-and-forget delivery of an event envelope. The default implementation
/// writes to the log; a bus-backed implementation plugs in here.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, envelope: &EventEnvelope);
}

/// Publishes events to the application log.
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, envelope: &EventEnvelope) {
        info!(
            event_id = %envelope.event_id,
            event_type = envelope.event.event_type(),
            occurred_on = %envelope.occurred_on,
            "Event published"
        );
    }
}

/// Stage an event inside the caller's transaction. The row becomes visible to
/// the publisher only once the transaction commits, so no event ever escapes a
/// rolled-back write.
pub async fn stage(
    tx: &mut Transaction<'_, Postgres>,
    event: &DomainEvent,
) -> ServiceResult<Uuid> {
    let event_id = Uuid::new_v4();
    let payload = serde_json::to_string(event)
        .map_err(|e| crate::error::ServiceError::Validation(format!("Unserializable event: {}", e)))?;

    sqlx::query(
        "INSERT INTO event_outbox (event_id, event_type, payload, occurred_on)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(event_id)
    .bind(event.event_type())
    .bind(payload)
    .bind(OffsetDateTime::now_utc())
    .execute(&mut **tx)
    .await?;

    debug!(event_id = %event_id, event_type = event.event_type(), "Event staged");
    Ok(event_id)
}

/// Deliver every committed, unpublished outbox row and mark it published.
/// SKIP LOCKED lets concurrent drains divide the backlog instead of blocking.
pub async fn publish_pending(pool: &PgPool, publisher: &dyn EventPublisher) -> ServiceResult<u64> {
    let mut tx = pool.begin().await?;

    let rows: Vec<OutboxRow> = sqlx::query_as(
        "SELECT event_id, event_type, payload, occurred_on FROM event_outbox
         WHERE published_at IS NULL
         ORDER BY occurred_on
         LIMIT 100
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut published = 0u64;
    for row in rows {
        let event: DomainEvent = match serde_json::from_str(&row.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    event_id = %row.event_id,
                    event_type = %row.event_type,
                    "Dropping undecodable outbox row: {}", e
                );
                sqlx::query("DELETE FROM event_outbox WHERE event_id = $1")
                    .bind(row.event_id)
                    .execute(&mut *tx)
                    .await?;
                continue;
            }
        };

        publisher.publish(&EventEnvelope {
            event_id: row.event_id,
            occurred_on: row.occurred_on,
            event,
        });

        sqlx::query("UPDATE event_outbox SET published_at = $1 WHERE event_id = $2")
            .bind(OffsetDateTime::now_utc())
            .bind(row.event_id)
            .execute(&mut *tx)
            .await?;

        published += 1;
    }

    tx.commit().await?;

    if published > 0 {
        debug!(published, "Outbox drained");
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_round_trip() {
        let event = DomainEvent::UserInvitationSentEvent {
            invitation_id: Uuid::new_v4(),
            company_id: 9,
            company_name: "Acme Tax".to_string(),
            company_domain: "acme-tax".to_string(),
            email: "new@acme.example".to_string(),
            invitation_link: "https://app.example/auth/invitation?email=new@acme.example&token=t"
                .to_string(),
            expires_at: OffsetDateTime::now_utc(),
        };

        let payload = serde_json::to_string(&event).unwrap();
        assert!(payload.contains("\"UserInvitationSentEvent\""));

        let decoded: DomainEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded.event_type(), "UserInvitationSentEvent");
    }

    #[test]
    fn test_envelope_carries_event_id_and_timestamp() {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            occurred_on: OffsetDateTime::now_utc(),
            event: DomainEvent::UserPresenceChangedEvent {
                user_id: 4,
                company_id: 2,
                online: true,
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("event_id"));
        assert!(json.contains("occurred_on"));
        assert!(json.contains("UserPresenceChangedEvent"));
    }
}
