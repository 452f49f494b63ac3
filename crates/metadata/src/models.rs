//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Groups
// =============================================================================

/// A time-bounded content record together with the object keys it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub group_id: Uuid,
    pub name: String,
    pub expires_at: OffsetDateTime,
    /// Object store keys in attachment order.
    pub object_keys: Vec<String>,
    /// Reconciliation passes that failed to remove this group.
    pub failed_attempts: u32,
    pub last_failure_at: Option<OffsetDateTime>,
    /// Earliest time the next removal attempt may run.
    pub next_attempt_at: Option<OffsetDateTime>,
}

impl Group {
    /// A group is expired once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the retry backoff still holds this group back at `now`.
    pub fn is_deferred(&self, now: OffsetDateTime) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }
}

/// Input for inserting a group from an API write path.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub group_id: Uuid,
    pub name: String,
    pub expires_at: OffsetDateTime,
    pub object_keys: Vec<String>,
}

/// Group row without its object keys.
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    pub group_id: Uuid,
    pub name: String,
    pub expires_at: OffsetDateTime,
    pub failed_attempts: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub next_attempt_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl GroupRow {
    pub fn into_group(self, object_keys: Vec<String>) -> Group {
        Group {
            group_id: self.group_id,
            name: self.name,
            expires_at: self.expires_at,
            object_keys,
            failed_attempts: u32::try_from(self.failed_attempts).unwrap_or(0),
            last_failure_at: self.last_failure_at,
            next_attempt_at: self.next_attempt_at,
        }
    }
}

/// One row of the groups ⟕ group_objects join used by `list_expired`.
///
/// `object_key` is NULL for groups without attached objects.
#[derive(Debug, Clone, FromRow)]
pub struct GroupObjectJoinRow {
    pub group_id: Uuid,
    pub name: String,
    pub expires_at: OffsetDateTime,
    pub failed_attempts: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub next_attempt_at: Option<OffsetDateTime>,
    pub object_key: Option<String>,
}

/// Fold join rows (ordered by group, then position) into groups.
pub fn fold_group_rows(rows: Vec<GroupObjectJoinRow>) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(group) if group.group_id == row.group_id => {
                if let Some(key) = row.object_key {
                    group.object_keys.push(key);
                }
            }
            _ => groups.push(Group {
                group_id: row.group_id,
                name: row.name,
                expires_at: row.expires_at,
                object_keys: row.object_key.into_iter().collect(),
                failed_attempts: u32::try_from(row.failed_attempts).unwrap_or(0),
                last_failure_at: row.last_failure_at,
                next_attempt_at: row.next_attempt_at,
            }),
        }
    }
    groups
}

// =============================================================================
// Reconciliation passes
// =============================================================================

/// Reconciliation pass record.
#[derive(Debug, Clone, FromRow)]
pub struct PassRow {
    pub pass_id: Uuid,
    pub state: String,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub stats_json: Option<String>,
}

// =============================================================================
// Schema migrations
// =============================================================================

/// Applied migration record.
#[derive(Debug, Clone, FromRow)]
pub struct MigrationRecordRow {
    pub version: i64,
    pub description: String,
    pub applied_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn join_row(id: Uuid, key: Option<&str>) -> GroupObjectJoinRow {
        GroupObjectJoinRow {
            group_id: id,
            name: "weekly menu".to_string(),
            expires_at: datetime!(2024-01-01 00:00 UTC),
            failed_attempts: 0,
            last_failure_at: None,
            next_attempt_at: None,
            object_key: key.map(str::to_string),
        }
    }

    #[test]
    fn test_fold_group_rows_keeps_order_and_empty_groups() {
        let g1 = Uuid::new_v4();
        let g2 = Uuid::new_v4();
        let groups = fold_group_rows(vec![
            join_row(g1, Some("a")),
            join_row(g1, Some("b")),
            join_row(g2, None),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, g1);
        assert_eq!(groups[0].object_keys, vec!["a", "b"]);
        assert_eq!(groups[1].group_id, g2);
        assert!(groups[1].object_keys.is_empty());
    }

    #[test]
    fn test_group_expiry_is_inclusive() {
        let group = fold_group_rows(vec![join_row(Uuid::new_v4(), None)]).remove(0);
        assert!(group.is_expired(datetime!(2024-01-01 00:00 UTC)));
        assert!(!group.is_expired(datetime!(2023-12-31 23:59 UTC)));
        assert!(!group.is_deferred(datetime!(2024-01-01 00:00 UTC)));
    }
}
