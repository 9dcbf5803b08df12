use serde::Serialize;

use crate::{RawRow, TargetSchema, TenderNotice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMatch {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Assignment {
    source_index: usize,
    target_index: usize,
    kind: ColumnMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixMatch {
    pub source: String,
    pub target: String,
}

/// Per-header diagnostics: which columns landed where and what was lost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnReport {
    pub exact: Vec<String>,
    pub prefix: Vec<PrefixMatch>,
    pub dropped: Vec<String>,
    pub unmatched_targets: Vec<String>,
}

impl ColumnReport {
    pub fn matched(&self) -> usize {
        self.exact.len() + self.prefix.len()
    }
}

/// Column assignment resolved once per header and applied to every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    targets: Vec<String>,
    assignments: Vec<Assignment>,
    report: ColumnReport,
}

impl ColumnPlan {
    pub fn resolve(columns: &[String], schema: &TargetSchema) -> Self {
        let candidates = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                candidate_for(column, schema).map(|(target_index, kind)| Assignment {
                    source_index: idx,
                    target_index,
                    kind,
                })
            })
            .collect::<Vec<_>>();

        // One winner per target: exact beats prefix, then header order.
        let mut winners: Vec<Option<Assignment>> = vec![None; schema.len()];
        for candidate in candidates.iter().flatten() {
            let slot = &mut winners[candidate.target_index];
            let replace = match slot {
                None => true,
                Some(current) => {
                    current.kind == ColumnMatch::Prefix && candidate.kind == ColumnMatch::Exact
                }
            };
            if replace {
                *slot = Some(candidate.clone());
            }
        }

        let mut assignments = winners.iter().flatten().cloned().collect::<Vec<_>>();
        assignments.sort_by_key(|a| a.source_index);

        let mut report = ColumnReport::default();
        for (idx, column) in columns.iter().enumerate() {
            match assignments.iter().find(|a| a.source_index == idx) {
                Some(a) if a.kind == ColumnMatch::Exact => {
                    report.exact.push(schema.fields()[a.target_index].clone())
                }
                Some(a) => report.prefix.push(PrefixMatch {
                    source: column.clone(),
                    target: schema.fields()[a.target_index].clone(),
                }),
                None => report.dropped.push(column.clone()),
            }
        }
        report.unmatched_targets = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(idx, _)| winners[*idx].is_none())
            .map(|(_, f)| f.clone())
            .collect();

        Self {
            targets: schema.fields().to_vec(),
            assignments,
            report,
        }
    }

    pub fn report(&self) -> &ColumnReport {
        &self.report
    }

    /// True when no source column maps onto the schema at all.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn apply(&self, values: &[String]) -> TenderNotice {
        let mut notice = TenderNotice::new();
        for assignment in &self.assignments {
            if let Some(value) = values.get(assignment.source_index) {
                notice.insert(self.targets[assignment.target_index].clone(), value.clone());
            }
        }
        notice
    }
}

/// Translates one raw row into target-schema keys using exact-then-prefix
/// matching against `schema`'s declared order.
pub fn remap_row(raw: &RawRow, schema: &TargetSchema) -> TenderNotice {
    ColumnPlan::resolve(raw.columns(), schema).apply(raw.values())
}

fn candidate_for(column: &str, schema: &TargetSchema) -> Option<(usize, ColumnMatch)> {
    if column.is_empty() {
        return None;
    }
    if let Some(idx) = schema.position(column) {
        return Some((idx, ColumnMatch::Exact));
    }
    // A truncated header names the longer target it was cut from; only fall
    // back to a shorter target the column extends when nothing is truncated.
    let fields = schema.fields();
    fields
        .iter()
        .position(|target| target.starts_with(column))
        .or_else(|| fields.iter().position(|target| column.starts_with(target.as_str())))
        .map(|idx| (idx, ColumnMatch::Prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        REFERENCE_NUMBER_FIELD, STATUS_FIELD, TARGET_FIELDS, TITLE_FIELD, UNSPSC_DESCRIPTION_FIELD,
    };

    fn scenario_schema() -> TargetSchema {
        TargetSchema::new(1, [TITLE_FIELD, REFERENCE_NUMBER_FIELD, STATUS_FIELD])
    }

    #[test]
    fn concrete_scenario_remaps_and_drops() {
        let raw = RawRow::from_pairs([
            ("title-titre-eng", "Build Bridge"),
            ("referenceNumber-numeroReference", "REF-001"),
            ("extraUnknownColumn", "ignored"),
        ]);
        let notice = remap_row(&raw, &scenario_schema());
        let expected = TenderNotice::from_pairs([
            ("title-titre-eng", "Build Bridge"),
            ("referenceNumber-numeroReference", "REF-001"),
        ]);
        assert_eq!(notice, expected);
        assert!(!notice.contains(STATUS_FIELD));
        assert!(!notice.contains("extraUnknownColumn"));
    }

    #[test]
    fn every_canonical_field_matches_exactly() {
        let schema = TargetSchema::canonical();
        let raw = RawRow::from_pairs(
            TARGET_FIELDS
                .iter()
                .enumerate()
                .map(|(i, f)| (f.to_string(), format!("value-{i}"))),
        );
        let notice = remap_row(&raw, &schema);
        for field in TARGET_FIELDS {
            assert_eq!(notice.get(field), raw.get(field), "field {field}");
        }
        let plan = ColumnPlan::resolve(raw.columns(), &schema);
        assert_eq!(plan.report().exact.len(), TARGET_FIELDS.len());
        assert!(plan.report().prefix.is_empty());
    }

    #[test]
    fn truncated_column_matches_by_prefix() {
        let raw = RawRow::from_pairs([("tenderStatus-appelOffres", "Open")]);
        let notice = remap_row(&raw, &scenario_schema());
        assert_eq!(notice.get(STATUS_FIELD), Some("Open"));
        assert_eq!(notice.len(), 1);
    }

    #[test]
    fn extended_column_matches_by_prefix() {
        let raw = RawRow::from_pairs([("title-titre-eng (long)", "Paving")]);
        let notice = remap_row(&raw, &scenario_schema());
        assert_eq!(notice.get(TITLE_FIELD), Some("Paving"));
    }

    #[test]
    fn exact_match_wins_over_earlier_prefix_column() {
        let raw = RawRow::from_pairs([("title", "prefix"), ("title-titre-eng", "exact")]);
        let plan = ColumnPlan::resolve(raw.columns(), &scenario_schema());
        let notice = plan.apply(raw.values());
        assert_eq!(notice.get(TITLE_FIELD), Some("exact"));
        assert_eq!(plan.report().dropped, vec!["title".to_string()]);
    }

    #[test]
    fn first_prefix_in_schema_order_wins() {
        let schema = TargetSchema::new(1, ["contactInfoName-x", "contactInfoCity-y"]);
        let raw = RawRow::from_pairs([("contactInfo", "Jane")]);
        let notice = remap_row(&raw, &schema);
        assert_eq!(notice.get("contactInfoName-x"), Some("Jane"));
        assert!(!notice.contains("contactInfoCity-y"));
    }

    #[test]
    fn truncated_canonical_headers_map_to_their_own_field() {
        let schema = TargetSchema::canonical();
        for field in TARGET_FIELDS {
            let truncated = &field[..field.len() - 1];
            let raw = RawRow::from_pairs([(truncated, "value")]);
            let notice = remap_row(&raw, &schema);
            assert_eq!(notice.get(field), Some("value"), "header {truncated:?}");
            assert_eq!(notice.len(), 1, "header {truncated:?}");
        }
    }

    #[test]
    fn truncated_description_is_not_captured_by_shorter_code_column() {
        let raw = RawRow::from_pairs([
            ("unspsc", "72141100"),
            ("unspscDescription-en", "Road construction"),
        ]);
        let plan = ColumnPlan::resolve(raw.columns(), &TargetSchema::canonical());
        let notice = plan.apply(raw.values());
        assert_eq!(notice.get("unspsc"), Some("72141100"));
        assert_eq!(notice.get(UNSPSC_DESCRIPTION_FIELD), Some("Road construction"));
        assert!(plan.report().dropped.is_empty());
    }

    #[test]
    fn extension_is_used_only_when_no_target_is_truncated() {
        let schema = TargetSchema::new(1, ["unspsc", "unspscDescription-eng"]);
        let raw = RawRow::from_pairs([("unspscCode", "72141100")]);
        let notice = remap_row(&raw, &schema);
        assert_eq!(notice.get("unspsc"), Some("72141100"));
        assert!(!notice.contains("unspscDescription-eng"));
    }

    #[test]
    fn missing_field_is_absent_but_explicit_empty_is_kept() {
        let raw = RawRow::from_pairs([(TITLE_FIELD, "")]);
        let notice = remap_row(&raw, &scenario_schema());
        assert_eq!(notice.get(TITLE_FIELD), Some(""));
        assert_eq!(notice.get(REFERENCE_NUMBER_FIELD), None);
    }

    #[test]
    fn row_without_matches_becomes_empty_record() {
        let raw = RawRow::from_pairs([("foo", "1"), ("bar", "2")]);
        let plan = ColumnPlan::resolve(raw.columns(), &scenario_schema());
        assert!(plan.is_empty());
        assert!(plan.apply(raw.values()).is_empty());
        assert_eq!(plan.report().dropped, vec!["foo".to_string(), "bar".to_string()]);
        assert_eq!(plan.report().unmatched_targets.len(), 3);
    }

    #[test]
    fn report_lists_prefix_pairs_and_unmatched_targets() {
        let raw = RawRow::from_pairs([("referenceNumber", "R-1"), (TITLE_FIELD, "T")]);
        let plan = ColumnPlan::resolve(raw.columns(), &scenario_schema());
        let report = plan.report();
        assert_eq!(report.exact, vec![TITLE_FIELD.to_string()]);
        assert_eq!(
            report.prefix,
            vec![PrefixMatch {
                source: "referenceNumber".into(),
                target: REFERENCE_NUMBER_FIELD.into(),
            }]
        );
        assert_eq!(report.unmatched_targets, vec![STATUS_FIELD.to_string()]);
        assert_eq!(report.matched(), 2);
    }
}
