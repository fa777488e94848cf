use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::builtin_schema::{
    builtin_schema_version, BUILTIN_FILE_ID, BUILTIN_PLUGIN_KEY, CHANGE_AUTHOR_SCHEMA_KEY,
    CHANGE_SET_ELEMENT_SCHEMA_KEY, COMMIT_EDGE_SCHEMA_KEY, COMMIT_SCHEMA_KEY,
    VERSION_TIP_SCHEMA_KEY,
};
use crate::commit::types::{
    ChangeRow, DomainChangeInput, GenerateCommitArgs, GenerateCommitResult, MaterializedRow,
};
use crate::version::version_tip_snapshot;
use crate::LixError;

/// Pure commit generation: given the batch of domain changes appended in one
/// commit boundary, produce the meta changes (commit record, change-set
/// elements, commit edges, tip update, change authors) and the materialized
/// upserts for every touched row. Identifier minting is injected so
/// deterministic mode drives it.
pub fn generate_commit<F>(
    args: GenerateCommitArgs,
    mut generate_uuid: F,
) -> Result<GenerateCommitResult, LixError>
where
    F: FnMut() -> String,
{
    if args.changes.is_empty() {
        return Ok(GenerateCommitResult {
            changes: Vec::new(),
            materialized: Vec::new(),
            commit_ids: BTreeMap::new(),
        });
    }

    let mut seen_ids = BTreeSet::new();
    for change in &args.changes {
        if !seen_ids.insert(change.id.clone()) {
            return Err(LixError::planner_invariant(format!(
                "generate_commit: duplicate change id '{}'",
                change.id
            )));
        }
    }

    let mut domain_by_version: BTreeMap<String, Vec<&DomainChangeInput>> = BTreeMap::new();
    for change in &args.changes {
        domain_by_version
            .entry(change.version_id.clone())
            .or_default()
            .push(change);
    }

    struct VersionMeta {
        commit_id: String,
        change_set_id: String,
        parent_commit_ids: Vec<String>,
    }

    let mut meta_by_version: BTreeMap<String, VersionMeta> = BTreeMap::new();
    for version_id in domain_by_version.keys() {
        let context = args.versions.get(version_id).ok_or_else(|| {
            LixError::planner_invariant(format!(
                "generate_commit: missing version context for '{version_id}'"
            ))
        })?;
        meta_by_version.insert(
            version_id.clone(),
            VersionMeta {
                commit_id: generate_uuid(),
                change_set_id: generate_uuid(),
                parent_commit_ids: context.parent_commit_ids.clone(),
            },
        );
    }

    let unique_accounts: Vec<String> = {
        let mut seen = BTreeSet::new();
        args.active_accounts
            .iter()
            .filter(|account| seen.insert((*account).clone()))
            .cloned()
            .collect()
    };

    let mut out_changes: Vec<ChangeRow> = Vec::new();
    let mut out_materialized: Vec<MaterializedRow> = Vec::new();

    // Domain rows first: they materialize under their own version with the
    // version's new commit id.
    for (version_id, domain_changes) in &domain_by_version {
        let meta = &meta_by_version[version_id];
        for change in domain_changes {
            let row = ChangeRow {
                id: change.id.clone(),
                entity_id: change.entity_id.clone(),
                schema_key: change.schema_key.clone(),
                schema_version: change.schema_version.clone(),
                file_id: change.file_id.clone(),
                plugin_key: change.plugin_key.clone(),
                snapshot_content: change.snapshot_content.clone(),
                metadata: change.metadata.clone(),
                created_at: change.created_at.clone(),
            };
            out_changes.push(row.clone());
            out_materialized.push(MaterializedRow {
                is_tombstone: row.snapshot_content.is_none(),
                change: row,
                version_id: version_id.clone(),
                commit_id: meta.commit_id.clone(),
            });
        }
    }

    // Meta rows: commit records, membership, ancestry, tips, and authorship,
    // all stored in the global version.
    for (version_id, meta) in &meta_by_version {
        let mut push_meta = |schema_key: &str,
                             entity_id: String,
                             snapshot: serde_json::Value,
                             id: String,
                             out_changes: &mut Vec<ChangeRow>,
                             out_materialized: &mut Vec<MaterializedRow>| {
            let row = ChangeRow {
                id,
                entity_id,
                schema_key: schema_key.to_string(),
                schema_version: builtin_schema_version(schema_key)
                    .unwrap_or("1")
                    .to_string(),
                file_id: BUILTIN_FILE_ID.to_string(),
                plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
                snapshot_content: Some(snapshot),
                metadata: None,
                created_at: args.timestamp.clone(),
            };
            out_changes.push(row.clone());
            out_materialized.push(MaterializedRow {
                change: row,
                version_id: crate::version::GLOBAL_VERSION_ID.to_string(),
                commit_id: meta.commit_id.clone(),
                is_tombstone: false,
            });
        };

        push_meta(
            COMMIT_SCHEMA_KEY,
            meta.commit_id.clone(),
            json!({ "id": meta.commit_id, "change_set_id": meta.change_set_id }),
            generate_uuid(),
            &mut out_changes,
            &mut out_materialized,
        );

        for parent_commit_id in &meta.parent_commit_ids {
            push_meta(
                COMMIT_EDGE_SCHEMA_KEY,
                format!("{}~{}", meta.commit_id, parent_commit_id),
                json!({ "child_id": meta.commit_id, "parent_id": parent_commit_id }),
                generate_uuid(),
                &mut out_changes,
                &mut out_materialized,
            );
        }

        push_meta(
            VERSION_TIP_SCHEMA_KEY,
            version_id.clone(),
            version_tip_snapshot(version_id, &meta.commit_id),
            generate_uuid(),
            &mut out_changes,
            &mut out_materialized,
        );

        for change in &domain_by_version[version_id] {
            push_meta(
                CHANGE_SET_ELEMENT_SCHEMA_KEY,
                format!("{}~{}", meta.change_set_id, change.id),
                json!({ "change_set_id": meta.change_set_id, "change_id": change.id }),
                generate_uuid(),
                &mut out_changes,
                &mut out_materialized,
            );

            for account_id in &unique_accounts {
                push_meta(
                    CHANGE_AUTHOR_SCHEMA_KEY,
                    format!("{}~{}", change.id, account_id),
                    json!({ "change_id": change.id, "account_id": account_id }),
                    generate_uuid(),
                    &mut out_changes,
                    &mut out_materialized,
                );
            }
        }
    }

    let commit_ids = meta_by_version
        .into_iter()
        .map(|(version_id, meta)| (version_id, meta.commit_id))
        .collect();

    Ok(GenerateCommitResult {
        changes: out_changes,
        materialized: out_materialized,
        commit_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::generate_commit;
    use crate::commit::types::{DomainChangeInput, GenerateCommitArgs, VersionContext};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn domain_change(id: &str, version_id: &str) -> DomainChangeInput {
        DomainChangeInput {
            id: id.to_string(),
            entity_id: format!("entity-{id}"),
            schema_key: "demo_item".to_string(),
            schema_version: "1".to_string(),
            file_id: "lix".to_string(),
            plugin_key: "lix".to_string(),
            snapshot_content: Some(json!({"id": format!("entity-{id}")})),
            metadata: None,
            created_at: "1970-01-01T00:00:00.000Z".to_string(),
            version_id: version_id.to_string(),
        }
    }

    fn args(changes: Vec<DomainChangeInput>) -> GenerateCommitArgs {
        let mut versions = BTreeMap::new();
        versions.insert(
            "main".to_string(),
            VersionContext {
                parent_commit_ids: vec!["commit-0".to_string()],
            },
        );
        GenerateCommitArgs {
            timestamp: "1970-01-01T00:00:00.000Z".to_string(),
            active_accounts: vec!["acct-1".to_string()],
            changes,
            versions,
        }
    }

    fn counter_uuid() -> impl FnMut() -> String {
        let mut counter = 0;
        move || {
            counter += 1;
            format!("uuid-{counter}")
        }
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let result = generate_commit(args(Vec::new()), counter_uuid()).expect("generate");
        assert!(result.changes.is_empty());
        assert!(result.materialized.is_empty());
    }

    #[test]
    fn emits_commit_tip_membership_edge_and_author_meta_changes() {
        let result =
            generate_commit(args(vec![domain_change("c1", "main")]), counter_uuid())
                .expect("generate");

        let schema_keys: Vec<&str> = result
            .changes
            .iter()
            .map(|change| change.schema_key.as_str())
            .collect();
        assert!(schema_keys.contains(&"demo_item"));
        assert!(schema_keys.contains(&"lix_commit"));
        assert!(schema_keys.contains(&"lix_commit_edge"));
        assert!(schema_keys.contains(&"lix_version_tip"));
        assert!(schema_keys.contains(&"lix_change_set_element"));
        assert!(schema_keys.contains(&"lix_change_author"));

        let commit_id = result.commit_ids.get("main").expect("commit id");
        let tip = result
            .changes
            .iter()
            .find(|change| change.schema_key == "lix_version_tip")
            .expect("tip change");
        assert_eq!(
            tip.snapshot_content.as_ref().unwrap()["commit_id"],
            json!(commit_id)
        );
        let edge = result
            .changes
            .iter()
            .find(|change| change.schema_key == "lix_commit_edge")
            .expect("edge change");
        assert_eq!(
            edge.snapshot_content.as_ref().unwrap()["parent_id"],
            json!("commit-0")
        );
    }

    #[test]
    fn tombstone_domain_changes_materialize_as_tombstones() {
        let mut change = domain_change("c1", "main");
        change.snapshot_content = None;
        let result = generate_commit(args(vec![change]), counter_uuid()).expect("generate");
        let row = result
            .materialized
            .iter()
            .find(|row| row.change.schema_key == "demo_item")
            .expect("domain row");
        assert!(row.is_tombstone);
    }

    #[test]
    fn duplicate_change_ids_are_rejected() {
        let err = generate_commit(
            args(vec![domain_change("c1", "main"), domain_change("c1", "main")]),
            counter_uuid(),
        )
        .expect_err("duplicate ids should fail");
        assert!(err.to_string().contains("duplicate change id"));
    }

    #[test]
    fn missing_version_context_is_an_invariant_violation() {
        let mut commit_args = args(vec![domain_change("c1", "other")]);
        commit_args.versions.clear();
        let err = generate_commit(commit_args, counter_uuid()).expect_err("should fail");
        assert_eq!(err.kind, crate::ErrorKind::PlannerInvariant);
    }

    #[test]
    fn meta_changes_land_in_the_global_version() {
        let result =
            generate_commit(args(vec![domain_change("c1", "main")]), counter_uuid())
                .expect("generate");
        for row in &result.materialized {
            if row.change.schema_key != "demo_item" {
                assert_eq!(row.version_id, "global");
            }
        }
    }
}
