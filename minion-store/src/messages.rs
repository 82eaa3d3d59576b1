//! Messaging - per-recipient inboxes, CC fan-out, broadcast dedup, triggers.

use crate::agents::{find_lead, lookup_agent, require_agent, staleness_violation, touch_last_seen};
use crate::store::{map_sql, now, opt_from_db, to_db};
use crate::{atomic_write, read_content, Store};
use chrono::Duration;
use minion_core::{
    scan_triggers, AgentClass, AgentName, DeliveredMessage, FlagKey, Message, MessageId,
    MinionResult, PreconditionError, RowIdType, Trigger,
};
use rusqlite::{params, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What a successful send produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutcome {
    pub from: AgentName,
    pub to: String,
    /// Concrete recipients a row was inserted for ("all" stays literal).
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub triggers: Vec<Trigger>,
}

impl Store {
    /// Send a message. One transaction covers the gate checks, the message
    /// rows (named agent, broadcast, or class fan-out), trigger flags, and
    /// the auto-CC to the lead.
    pub fn send(
        &mut self,
        from: &AgentName,
        to: &str,
        content: &str,
        cc: &[AgentName],
    ) -> MinionResult<SendOutcome> {
        let from = from.clone();
        // "broadcast" is a spelling alias; "all" is the code path.
        let to = if to == "broadcast" { "all".to_string() } else { to.to_string() };
        let content = content.to_string();
        let cc: Vec<AgentName> = cc.to_vec();
        let paths = self.paths.clone();

        self.with_tx(|tx| {
            let ts = now();
            let sender = require_agent(tx, &from)?;
            let triggers = scan_triggers(&content);
            let bears_fenix = triggers.contains(&Trigger::FenixDown);

            // Gate order: freshness, inbox discipline, plan, moon_crash.
            // A fenix-bearing message is a mayday and passes everything.
            if !bears_fenix {
                if let Some(stale) = staleness_violation(&sender, ts) {
                    return Err(stale.into());
                }
                let unread = unread_count(tx, &from)?;
                if unread > 0 {
                    return Err(PreconditionError::UnreadInbox { unread }.into());
                }
                let active_plans: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM battle_plans WHERE status = 'active'",
                        [],
                        |r| r.get(0),
                    )
                    .map_err(map_sql)?;
                if active_plans == 0 {
                    return Err(PreconditionError::NoActivePlan.into());
                }
                if sender.class != AgentClass::Lead {
                    if let Some((set_by, set_at)) = crate::flags::flag_state(tx, FlagKey::MoonCrash)? {
                        return Err(PreconditionError::MoonCrash { set_by, set_at }.into());
                    }
                }
            }

            // Resolve the literal recipient list.
            let mut recipients: Vec<String> = Vec::new();
            if to == "all" {
                recipients.push("all".to_string());
            } else if let Ok(class) = AgentClass::from_db_str(&to) {
                // Class-named recipient: one row per registered member.
                // Zero members is an empty delivery, not an error.
                let mut stmt = tx
                    .prepare("SELECT name FROM agents WHERE agent_class = ?1 AND name != ?2 ORDER BY name")
                    .map_err(map_sql)?;
                let members: Vec<String> = stmt
                    .query_map(params![class.as_db_str(), from.as_str()], |r| r.get(0))
                    .map_err(map_sql)?
                    .collect::<Result<_, _>>()
                    .map_err(map_sql)?;
                recipients.extend(members);
            } else {
                let known = lookup_agent(tx, &AgentName::from(to.as_str()))?;
                if known.is_none() {
                    return Err(PreconditionError::UnknownRecipient {
                        recipient: to.clone(),
                    }
                    .into());
                }
                recipients.push(to.clone());
            }

            for recipient in &recipients {
                let file = paths.message_file(recipient, &from, "msg", ts);
                atomic_write(&file, &content)?;
                tx.execute(
                    "INSERT INTO messages (from_agent, to_agent, content_file, timestamp, read_flag, is_cc)
                     VALUES (?1, ?2, ?3, ?4, 0, 0)",
                    params![from.as_str(), recipient, file.display().to_string(), to_db(ts)],
                )
                .map_err(map_sql)?;
            }

            // Auto-CC: when neither endpoint is the lead, the lead sees a
            // copy carrying the original addressing.
            let mut cc_list: Vec<String> = cc.iter().map(|a| a.to_string()).collect();
            if let Some(lead) = find_lead(tx)? {
                let lead_involved = from.as_str() == lead.as_str()
                    || recipients.iter().any(|r| r == lead.as_str())
                    || to == "all";
                if !lead_involved && !cc_list.contains(&lead.to_string()) {
                    cc_list.push(lead.to_string());
                }
            }
            cc_list.retain(|c| c != from.as_str() && !recipients.contains(c));

            for cc_agent in &cc_list {
                let file = paths.message_file(cc_agent, &from, "cc", ts);
                atomic_write(&file, &content)?;
                tx.execute(
                    "INSERT INTO messages (from_agent, to_agent, content_file, timestamp, read_flag, is_cc, cc_original_to)
                     VALUES (?1, ?2, ?3, ?4, 0, 1, ?5)",
                    params![from.as_str(), cc_agent, file.display().to_string(), to_db(ts), to],
                )
                .map_err(map_sql)?;
            }

            // Active triggers flip flags inside this same transaction.
            for trigger in &triggers {
                match trigger {
                    Trigger::MoonCrash => {
                        crate::flags::set_flag(tx, FlagKey::MoonCrash, &from)?;
                        info!(set_by = %from, "moon_crash flag set by trigger");
                    }
                    Trigger::StandDown => {
                        crate::flags::set_flag(tx, FlagKey::StandDown, &from)?;
                        info!(set_by = %from, "stand_down flag set by trigger");
                    }
                    _ => debug!(trigger = %trigger, from = %from, "advisory trigger observed"),
                }
            }

            touch_last_seen(tx, &from)?;

            Ok(SendOutcome {
                from: from.clone(),
                to: to.clone(),
                recipients: recipients.clone(),
                cc: cc_list,
                triggers,
            })
        })
    }

    /// Drain the inbox: return every unread direct message plus every
    /// broadcast not yet observed by this agent, marking them read /
    /// observed in the same transaction. Ordered by (timestamp, id).
    pub fn check_inbox(&mut self, name: &AgentName) -> MinionResult<Vec<DeliveredMessage>> {
        let name = name.clone();
        self.with_tx(|tx| {
            require_agent(tx, &name)?;
            let ts = to_db(now());
            tx.execute(
                "UPDATE agents SET last_seen = ?1, last_inbox_check = ?1 WHERE name = ?2",
                params![ts, name.as_str()],
            )
            .map_err(map_sql)?;

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM messages WHERE to_agent = ?1 AND read_flag = 0
                     ORDER BY timestamp ASC, id ASC",
                )
                .map_err(map_sql)?;
            let mut delivered: Vec<Message> = stmt
                .query_map(params![name.as_str()], message_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            for msg in &delivered {
                tx.execute(
                    "UPDATE messages SET read_flag = 1 WHERE id = ?1",
                    params![msg.id.as_i64()],
                )
                .map_err(map_sql)?;
            }

            let mut stmt = tx
                .prepare(
                    "SELECT * FROM messages WHERE to_agent = 'all' AND from_agent != ?1
                     AND id NOT IN (SELECT message_id FROM broadcast_reads WHERE agent_name = ?1)
                     ORDER BY timestamp ASC, id ASC",
                )
                .map_err(map_sql)?;
            let broadcasts: Vec<Message> = stmt
                .query_map(params![name.as_str()], message_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            drop(stmt);

            for msg in &broadcasts {
                tx.execute(
                    "INSERT OR IGNORE INTO broadcast_reads (agent_name, message_id) VALUES (?1, ?2)",
                    params![name.as_str(), msg.id.as_i64()],
                )
                .map_err(map_sql)?;
            }

            delivered.extend(broadcasts);
            delivered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

            Ok(delivered
                .into_iter()
                .map(|message| DeliveredMessage {
                    content: read_content(&message.content_file),
                    message,
                })
                .collect())
        })
    }

    /// Delete read messages older than the purge window; unread survive.
    pub fn purge_inbox(&mut self, name: &AgentName, older_than_hours: i64) -> MinionResult<usize> {
        let name = name.clone();
        self.with_tx(|tx| {
            let cutoff = to_db(now() - Duration::hours(older_than_hours));
            let deleted = tx
                .execute(
                    "DELETE FROM messages WHERE to_agent = ?1 AND read_flag = 1 AND timestamp < ?2",
                    params![name.as_str(), cutoff],
                )
                .map_err(map_sql)?;
            // Observed broadcasts whose rows are gone leave no tombstones.
            tx.execute(
                "DELETE FROM broadcast_reads WHERE agent_name = ?1
                 AND message_id NOT IN (SELECT id FROM messages)",
                params![name.as_str()],
            )
            .map_err(map_sql)?;
            Ok(deleted)
        })
    }

    /// Deliver a system-originated alert directly to an agent. System
    /// traffic bypasses the send gates: it is how the kernel reports
    /// failures, so it must work when nothing else does.
    pub fn system_alert(&mut self, to: &AgentName, content: &str) -> MinionResult<MessageId> {
        let to = to.clone();
        let content = content.to_string();
        let paths = self.paths.clone();
        self.with_tx(|tx| insert_system_message(tx, &paths, &to, &content))
    }

    /// Last `count` messages across all agents, oldest first.
    pub fn get_history(&mut self, count: usize) -> MinionResult<Vec<DeliveredMessage>> {
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare("SELECT * FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?1")
                .map_err(map_sql)?;
            let mut msgs: Vec<Message> = stmt
                .query_map(params![count as i64], message_from_row)
                .map_err(map_sql)?
                .collect::<Result<_, _>>()
                .map_err(map_sql)?;
            msgs.reverse();
            Ok(msgs
                .into_iter()
                .map(|message| DeliveredMessage {
                    content: read_content(&message.content_file),
                    message,
                })
                .collect())
        })
    }
}

/// Unread direct messages plus unobserved broadcasts for an agent.
pub(crate) fn unread_count(tx: &Transaction<'_>, name: &AgentName) -> MinionResult<i64> {
    let direct: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE to_agent = ?1 AND read_flag = 0",
            params![name.as_str()],
            |r| r.get(0),
        )
        .map_err(map_sql)?;
    let broadcast: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE to_agent = 'all' AND from_agent != ?1
             AND id NOT IN (SELECT message_id FROM broadcast_reads WHERE agent_name = ?1)",
            params![name.as_str()],
            |r| r.get(0),
        )
        .map_err(map_sql)?;
    Ok(direct + broadcast)
}

/// Insert a system-originated message (HP alerts, poll-failure alerts)
/// inside the caller's transaction.
pub(crate) fn insert_system_message(
    tx: &Transaction<'_>,
    paths: &crate::WorkPaths,
    to: &AgentName,
    content: &str,
) -> MinionResult<MessageId> {
    let ts = now();
    let file = paths.message_file(to.as_str(), &AgentName::from("system"), "alert", ts);
    atomic_write(&file, content)?;
    tx.execute(
        "INSERT INTO messages (from_agent, to_agent, content_file, timestamp, read_flag, is_cc)
         VALUES ('system', ?1, ?2, ?3, 0, 0)",
        params![to.as_str(), file.display().to_string(), to_db(ts)],
    )
    .map_err(map_sql)?;
    Ok(MessageId::new(tx.last_insert_rowid()))
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::new(row.get("id")?),
        from_agent: AgentName::from(row.get::<_, String>("from_agent")?),
        to_agent: row.get("to_agent")?,
        content_file: row.get("content_file")?,
        timestamp: opt_from_db(Some(row.get::<_, String>("timestamp")?))
            .unwrap_or_else(chrono::Utc::now),
        read: row.get::<_, i64>("read_flag")? != 0,
        is_cc: row.get::<_, i64>("is_cc")? != 0,
        cc_original_to: row.get("cc_original_to")?,
    })
}

/// The trigger codebook, rendered for `list-triggers`.
pub fn trigger_codebook() -> Vec<serde_json::Value> {
    Trigger::ALL
        .iter()
        .map(|t| {
            serde_json::json!({
                "code": t.as_db_str(),
                "active": t.is_active(),
                "meaning": t.meaning(),
                "usage": format!("!!{}!!", t.as_db_str()),
            })
        })
        .collect()
}
