//! Filter-to-SQL translation and the `find()` operation.

use std::collections::HashMap;

use nostr::{EventId, Filter, PublicKey, Tag};
use rusqlite::types::Value as SqlValue;

use super::{codec, Error, LocalStore};

/// A caller-supplied key identifying one filter in a batch `find()` call.
/// Any `Eq + Hash + Clone` type works; the worker uses its own request id.
pub trait Request: std::hash::Hash + Eq + Clone {}
impl<T: std::hash::Hash + Eq + Clone> Request for T {}

/// One decoded row from `events`: the top-level columns plus the
/// decompressed blob triple.
///
/// `id` holds whatever was stored in the primary-key column — the event's
/// own hash id for regular/ephemeral kinds, or the synthetic
/// `"<kind>:<pubkey>:<d>"` key for replaceable/addressable ones. It is
/// intentionally a plain string rather than a re-parsed
/// [`EventId`]/[`Event`]: the synthetic key is not a valid hash id, so the
/// store's decoded rows are its own small value type rather than being
/// forced back through the `nostr` crate's event model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: String,
    pub pubkey: String,
    pub kind: u64,
    pub created_at: i64,
    pub content: String,
    pub tags: Vec<Tag>,
    pub sig: Option<String>,
}

struct Translated {
    sql: String,
    params: Vec<SqlValue>,
}

/// Translates one [`Filter`] into a SQL statement and its positional
/// parameters.
fn translate(filter: &Filter, enable_fts: bool) -> Translated {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(ids) = &filter.ids {
        push_in_clause(&mut clauses, &mut params, "id", ids.iter().map(EventId::to_hex));
    }
    if let Some(authors) = &filter.authors {
        push_in_clause(&mut clauses, &mut params, "pubkey", authors.iter().map(PublicKey::to_hex));
    }
    if let Some(kinds) = &filter.kinds {
        push_in_clause(
            &mut clauses,
            &mut params,
            "kind",
            kinds.iter().map(|k| k.as_u64().to_string()),
        );
    }

    // Tag semantics: OR within one tag key, AND across distinct keys.
    for (tag_key, values) in &filter.generic_tags {
        if values.is_empty() {
            continue;
        }
        let placeholders: Vec<String> = values
            .iter()
            .map(|v| {
                params.push(SqlValue::Text(format!("{}:{}", tag_key, v)));
                format!("?{}", params.len())
            })
            .collect();
        clauses.push(format!(
            "id IN (SELECT event_id FROM event_tags WHERE value IN ({}))",
            placeholders.join(", ")
        ));
    }

    if let Some(since) = filter.since {
        params.push(SqlValue::Integer(since.as_u64() as i64));
        clauses.push(format!("created_at > ?{}", params.len()));
    }
    if let Some(until) = filter.until {
        params.push(SqlValue::Integer(until.as_u64() as i64));
        clauses.push(format!("created_at < ?{}", params.len()));
    }

    if enable_fts {
        if let Some(search) = &filter.search {
            if !search.is_empty() {
                params.push(SqlValue::Text(search.clone()));
                clauses.push(format!(
                    "id IN (SELECT event_id FROM events_fts WHERE events_fts MATCH ?{})",
                    params.len()
                ));
            }
        }
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let limit_clause = match filter.limit {
        Some(limit) if limit > 0 => format!(" LIMIT {limit}"),
        _ => String::new(),
    };

    let sql = format!(
        "SELECT id, pubkey, kind, created_at, blob FROM events{}ORDER BY created_at DESC{}",
        where_clause, limit_clause
    );

    Translated { sql, params }
}

fn push_in_clause(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    let placeholders: Vec<String> = values
        .map(|v| {
            params.push(SqlValue::Text(v));
            format!("?{}", params.len())
        })
        .collect();
    if !placeholders.is_empty() {
        clauses.push(format!("{} IN ({})", column, placeholders.join(", ")));
    }
}

impl LocalStore {
    /// Runs a batch of filters and returns the decoded rows matching each,
    /// in `created_at` descending order, truncated to the filter's limit.
    pub fn find<R: Request>(&self, filters: &[(R, Filter)]) -> Result<HashMap<R, Vec<StoredEvent>>, Error> {
        let enable_fts = self.config().enable_fts;
        let mut out = HashMap::new();

        for (request, filter) in filters {
            let translated = translate(filter, enable_fts);
            let mut stmt = self.conn.prepare(&translated.sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(translated.params.iter()), |row| {
                let id: String = row.get(0)?;
                let pubkey: String = row.get(1)?;
                let kind: u64 = row.get(2)?;
                let created_at: i64 = row.get(3)?;
                let blob: Vec<u8> = row.get(4)?;
                Ok((id, pubkey, kind, created_at, blob))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, pubkey, kind, created_at, blob) = row?;
                match codec::decode(&blob) {
                    Ok(payload) => match serde_json::from_value::<Vec<Tag>>(payload.tags) {
                        Ok(tags) => events.push(StoredEvent {
                            id,
                            pubkey,
                            kind,
                            created_at,
                            content: payload.content,
                            tags,
                            sig: payload.sig,
                        }),
                        Err(e) => {
                            tracing::warn!(event_id = %id, error = %e, "failed to decode stored tags");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(event_id = %id, error = %e, "failed to decode stored blob");
                    }
                }
            }

            out.insert(request.clone(), events);
        }

        Ok(out)
    }
}
