use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Self-declared capabilities, exchanged in the handshake and re-broadcast
/// whenever the local copy changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Free-form role, e.g. "Researcher" or "Coder".
    pub role: String,
    /// Ordered skill list used by capability search.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Human-readable display name; task targets match it case-insensitively.
    pub agent_id: String,
    /// Opaque extra capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<Value>,
}

impl Manifest {
    /// Case-insensitive substring match over skills and role.
    ///
    /// An absent filter matches everything; both filters must hold when both
    /// are given.
    pub fn matches(&self, skill: Option<&str>, role: Option<&str>) -> bool {
        let skill_ok = match skill {
            None => true,
            Some(s) => {
                let needle = s.to_lowercase();
                self.skills.iter().any(|k| k.to_lowercase().contains(&needle))
            }
        };
        let role_ok = match role {
            None => true,
            Some(r) => self.role.to_lowercase().contains(&r.to_lowercase()),
        };
        skill_ok && role_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            role: "Security Researcher".into(),
            skills: vec!["Python".into(), "contract-audit".into()],
            agent_id: "ghost".into(),
            specs: None,
        }
    }

    #[test]
    fn skill_search_is_case_insensitive_substring() {
        let m = manifest();
        assert!(m.matches(Some("python"), None));
        assert!(m.matches(Some("AUDIT"), None));
        assert!(!m.matches(Some("golang"), None));
    }

    #[test]
    fn role_and_skill_filters_combine() {
        let m = manifest();
        assert!(m.matches(Some("python"), Some("researcher")));
        assert!(!m.matches(Some("python"), Some("notary")));
        assert!(m.matches(None, None));
    }
}
