//! The identity the agent executor acts under.

use crate::config::PersonaConfig;

/// Who the agent is. Rendered into the system prompt and attached to every
/// tool invocation and annotation as the acting agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

impl Persona {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            goal: String::new(),
            backstory: String::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }
}

impl From<&PersonaConfig> for Persona {
    fn from(config: &PersonaConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            role: config.role.clone(),
            goal: config.goal.clone(),
            backstory: config.backstory.clone(),
        }
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::from(&PersonaConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_from_config() {
        let config = PersonaConfig {
            id: "coder-1".to_string(),
            name: "Coder".to_string(),
            ..PersonaConfig::default()
        };
        let persona = Persona::from(&config);
        assert_eq!(persona.id, "coder-1");
        assert_eq!(persona.name, "Coder");
        assert_eq!(persona.role, config.role);
    }

    #[test]
    fn builder_sets_optional_fields() {
        let persona = Persona::new("p", "Pat", "reviewer")
            .with_goal("find bugs")
            .with_backstory("ten years of code review");
        assert_eq!(persona.goal, "find bugs");
        assert!(persona.backstory.starts_with("ten"));
    }
}
