//! # Topology Resolver
//!
//! Enumerates the child tables currently matching a subscription's `SELECT`
//! by rewriting its projection into `select tbid(tbname)` and running the
//! result as an auxiliary query. The `FROM ...` tail, `WHERE` clause included,
//! is kept verbatim so the same tag filter applies.

use tracing::{debug, error};

use crate::client::{Connection, TableIdTags};
use crate::error::{Result, SubscribeError};

/// Projection of the auxiliary table-id query.
pub const TABLE_ID_PROJECTION: &str = "select tbid(tbname)";

/// Byte offset of the `from` keyword that opens the statement's `FROM` clause.
///
/// The keyword is matched case-insensitively, must be surrounded by
/// whitespace, and is ignored inside quoted strings and identifiers.
pub fn find_from_clause(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    let mut prev_is_space = false;

    for (idx, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            prev_is_space = false;
            continue;
        }

        match b {
            b'\'' | b'"' | b'`' => {
                quote = Some(b);
                prev_is_space = false;
            }
            _ if b.is_ascii_whitespace() => prev_is_space = true,
            _ => {
                if prev_is_space && is_from_keyword(&bytes[idx..]) {
                    return Some(idx);
                }
                prev_is_space = false;
            }
        }
    }
    None
}

fn is_from_keyword(rest: &[u8]) -> bool {
    rest.len() > 4
        && rest[..4].eq_ignore_ascii_case(b"from")
        && rest[4].is_ascii_whitespace()
}

/// Builds `select tbid(tbname) from ...` out of a subscription statement.
pub fn table_id_sql(sql: &str) -> Option<String> {
    find_from_clause(sql).map(|idx| format!("{} {}", TABLE_ID_PROJECTION, &sql[idx..]))
}

/// Runs the auxiliary query for `sql` and collects the matching child tables.
///
/// The returned vector is in the order produced by the database.
pub async fn resolve_tables<C: Connection>(conn: &C, sql: &str) -> Result<Vec<TableIdTags>> {
    let aux = table_id_sql(sql).ok_or_else(|| SubscribeError::MissingFromClause(sql.to_string()))?;

    let tables = conn.query_table_ids(&aux).await.map_err(|e| {
        error!(error = %e, "failed to retrieve table id");
        SubscribeError::TopologyQueryFailed(e)
    })?;

    debug!(tables = tables.len(), "table list retrieved");
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_projection_and_keeps_the_tail() {
        assert_eq!(
            table_id_sql("select * from s where t1 > 3").as_deref(),
            Some("select tbid(tbname) from s where t1 > 3")
        );
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        assert_eq!(
            table_id_sql("SELECT ts, v FROM Meters").as_deref(),
            Some("select tbid(tbname) FROM Meters")
        );
    }

    #[test]
    fn from_inside_quotes_or_identifiers_is_skipped() {
        let sql = "select 'a from b' as x, fromage from s";
        let idx = find_from_clause(sql).unwrap();
        assert_eq!(&sql[idx..], "from s");
        assert_eq!(find_from_clause("select * fromage"), None);
    }

    #[test]
    fn any_whitespace_delimits_the_keyword() {
        assert_eq!(
            table_id_sql("select *\nfrom\ts").as_deref(),
            Some("select tbid(tbname) from\ts")
        );
    }

    #[test]
    fn statement_without_from_has_no_table_query() {
        assert_eq!(table_id_sql("select server_status()"), None);
        assert_eq!(table_id_sql("select * from"), None);
    }
}
