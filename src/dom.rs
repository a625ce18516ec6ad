use crate::types::AccessibilityNode;

/// Upper bound on candidates handed to the decision service per cycle.
pub const MAX_SNAPSHOT_NODES: usize = 200;
/// Names longer than this are cut before leaving the filter.
pub const MAX_NAME_CHARS: usize = 100;

const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "textbox", "checkbox", "combobox", "listbox", "searchbox", "menuitem",
    "menu", "tab",
];

/// Reduces a full accessibility tree to the nodes worth showing the decision
/// service, in source order.
///
/// Rules, applied to non-ignored nodes:
///   - interactive roles are always kept;
///   - static text needs a name longer than three characters;
///   - images and every other role need a non-empty name.
pub fn filter_snapshot(raw: &[AccessibilityNode]) -> Vec<AccessibilityNode> {
    raw.iter()
        .filter(|node| is_candidate(node))
        .take(MAX_SNAPSHOT_NODES)
        .map(|node| AccessibilityNode {
            id: node.id.clone(),
            role: node.role.clone(),
            name: node.name.chars().take(MAX_NAME_CHARS).collect(),
            backing_element_id: node.backing_element_id,
            ignored: false,
        })
        .collect()
}

fn is_candidate(node: &AccessibilityNode) -> bool {
    if node.ignored {
        return false;
    }
    let role = node.role.to_ascii_lowercase();
    let name_len = node.name.chars().count();
    if INTERACTIVE_ROLES.contains(&role.as_str()) {
        return true;
    }
    match role.as_str() {
        "statictext" => name_len > 3,
        _ => name_len > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: usize, role: &str, name: &str) -> AccessibilityNode {
        AccessibilityNode {
            id: id.to_string(),
            role: role.to_string(),
            name: name.to_string(),
            backing_element_id: Some(id as i64),
            ignored: false,
        }
    }

    #[test]
    fn keeps_only_the_button() {
        let raw = vec![
            node(1, "button", "Submit"),
            node(2, "div", ""),
            node(3, "statictext", "ab"),
        ];
        let kept = filter_snapshot(&raw);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "1");
        assert_eq!(kept[0].role, "button");
    }

    #[test]
    fn applies_role_specific_rules() {
        let mut hidden = node(1, "link", "Home");
        hidden.ignored = true;
        let raw = vec![
            hidden,
            node(2, "StaticText", "Welcome back"),
            node(3, "image", ""),
            node(4, "image", "Logo"),
            node(5, "textbox", ""),
            node(6, "heading", "News"),
            node(7, "generic", ""),
        ];
        let ids: Vec<_> = filter_snapshot(&raw).into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["2", "4", "5", "6"]);
    }

    #[test]
    fn truncates_names_on_char_boundaries() {
        let long = "é".repeat(150);
        let kept = filter_snapshot(&[node(1, "button", &long)]);
        assert_eq!(kept[0].name.chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn caps_at_the_first_matches_in_source_order() {
        let raw: Vec<_> = (0..500)
            .map(|i| {
                if i % 2 == 0 {
                    node(i, "button", "Go")
                } else {
                    node(i, "generic", "")
                }
            })
            .collect();
        let kept = filter_snapshot(&raw);
        assert_eq!(kept.len(), MAX_SNAPSHOT_NODES);
        let expected: Vec<_> = (0..500)
            .step_by(2)
            .take(MAX_SNAPSHOT_NODES)
            .map(|i| i.to_string())
            .collect();
        let ids: Vec<_> = kept.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn short_lists_pass_through_unchanged_in_order() {
        let raw = vec![node(3, "link", "a"), node(1, "tab", "b"), node(2, "menu", "")];
        let ids: Vec<_> = filter_snapshot(&raw).into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }
}
