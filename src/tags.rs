use std::collections::BTreeMap;

/// Named groups of usernames that can be pinged together with `@name`.
pub struct TagDirectory {
    groups: BTreeMap<String, Vec<String>>,
}

impl TagDirectory {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|(name, members)| {
                let members = members
                    .into_iter()
                    .map(|m| m.trim_start_matches('@').to_string())
                    .filter(|m| !m.is_empty())
                    .collect();
                (name.to_lowercase(), members)
            })
            .collect();
        Self { groups }
    }

    /// Mentions for the first tag written in `text`, if any.
    pub fn mentions_in(&self, text: &str) -> Option<String> {
        let text = text.to_lowercase();
        self.groups
            .iter()
            .find(|(name, _)| text.contains(&format!("@{name}")))
            .map(|(_, members)| mention_line(members))
            .filter(|line| !line.is_empty())
    }

    pub fn groups_text(&self) -> String {
        if self.groups.is_empty() {
            return "No tag groups configured.".to_string();
        }
        let mut text = String::from("👥 <b>Tag groups:</b>\n\n");
        for (name, members) in &self.groups {
            text.push_str(&format!("<b>{}:</b>\n", name.to_uppercase()));
            for (i, member) in members.iter().enumerate() {
                text.push_str(&format!("{}. @{member}\n", i + 1));
            }
            text.push('\n');
        }
        text
    }

    pub fn tags_text(&self) -> String {
        if self.groups.is_empty() {
            return "No tags configured.".to_string();
        }
        let mut text = String::from("🏷️ <b>Available tags:</b>\n\nJust write in the chat:\n");
        for name in self.groups.keys() {
            text.push_str(&format!("• @{name}\n"));
        }
        text.push_str("\n🤖 I will mention everyone in the group!");
        text
    }
}

fn mention_line(members: &[String]) -> String {
    members
        .iter()
        .map(|m| format!("@{m}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> TagDirectory {
        TagDirectory::new(BTreeMap::from([
            ("Team".to_string(), vec!["alice".to_string(), "@bob".to_string()]),
            ("coach".to_string(), vec!["carol".to_string()]),
            ("empty".to_string(), vec![String::new()]),
        ]))
    }

    #[test]
    fn test_mentions_case_insensitive() {
        let tags = directory();
        assert_eq!(tags.mentions_in("hey @TEAM, training at 6").as_deref(), Some("@alice @bob"));
        assert_eq!(tags.mentions_in("ask @coach").as_deref(), Some("@carol"));
    }

    #[test]
    fn test_no_mentions() {
        let tags = directory();
        assert!(tags.mentions_in("team meeting").is_none());
        assert!(tags.mentions_in("@nobody").is_none());
        assert!(tags.mentions_in("@empty").is_none());
    }

    #[test]
    fn test_listing_texts() {
        let tags = directory();
        let groups = tags.groups_text();
        assert!(groups.contains("<b>TEAM:</b>\n1. @alice\n2. @bob\n"));
        let list = tags.tags_text();
        assert!(list.contains("• @coach\n"));
        assert!(list.contains("• @team\n"));

        let none = TagDirectory::new(BTreeMap::new());
        assert_eq!(none.tags_text(), "No tags configured.");
    }
}
