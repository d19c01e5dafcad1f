//! Dataset classification from feed metadata
//!
//! Rules are tried in order and the first match wins. The order matters:
//! a dataset whose identifier says `plan` is a plan dataset even when its
//! title mentions inspections.

use crate::store::RecordKind;

/// Which metadata field a rule looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Identifier,
    Title,
}

struct Rule {
    field: Field,
    needle: &'static str,
    kind: RecordKind,
}

const RULES: &[Rule] = &[
    Rule {
        field: Field::Identifier,
        needle: "plan",
        kind: RecordKind::Plan,
    },
    Rule {
        field: Field::Title,
        needle: "план",
        kind: RecordKind::Plan,
    },
    Rule {
        field: Field::Identifier,
        needle: "inspection",
        kind: RecordKind::Inspection,
    },
    Rule {
        field: Field::Title,
        needle: "проверк",
        kind: RecordKind::Inspection,
    },
];

/// Classify a dataset by its identifier and title. `None` means unknown;
/// the link is accepted for call-site symmetry but carries no signal.
pub fn classify_dataset(identifier: &str, title: &str, _link: &str) -> Option<RecordKind> {
    let identifier = identifier.to_lowercase();
    let title = title.to_lowercase();

    RULES
        .iter()
        .find(|rule| {
            let haystack = match rule.field {
                Field::Identifier => &identifier,
                Field::Title => &title,
            };
            haystack.contains(rule.needle)
        })
        .map(|rule| rule.kind)
}
