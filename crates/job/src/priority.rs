use std::str::FromStr;

/// Named priority levels. Lower values are serviced first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn value(&self) -> i32 {
        match self {
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::Medium => -5,
            Priority::High => -10,
            Priority::Critical => -15,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown priority level '{0}'")]
pub struct ParsePriorityError(pub String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ParsePriorityError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_levels_map_to_fixed_numbers() {
        assert_eq!(i32::from(Priority::Low), 10);
        assert_eq!(i32::from(Priority::Normal), 0);
        assert_eq!(i32::from(Priority::Medium), -5);
        assert_eq!(i32::from(Priority::High), -10);
        assert_eq!(i32::from(Priority::Critical), -15);
    }

    #[test]
    fn parses_level_names() {
        assert_eq!("high".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }
}
