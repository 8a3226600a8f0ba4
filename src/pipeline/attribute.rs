//! Demographic attributes and their label sets

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::AnalysisError;

/// Gender labels, in model output order
pub const GENDER_LABELS: &[&str] = &["Woman", "Man"];

/// Race labels, in model output order
pub const RACE_LABELS: &[&str] = &[
    "asian",
    "indian",
    "black",
    "white",
    "middle eastern",
    "latino hispanic",
];

/// Emotion labels, in model output order (FER-2013 classes)
pub const EMOTION_LABELS: &[&str] = &[
    "angry", "disgust", "fear", "happy", "sad", "surprise", "neutral",
];

/// One demographic dimension analyzed per face
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    Age,
    Gender,
    Race,
    Emotion,
}

impl Attribute {
    pub const ALL: [Attribute; 4] = [
        Attribute::Age,
        Attribute::Gender,
        Attribute::Race,
        Attribute::Emotion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Age => "age",
            Attribute::Gender => "gender",
            Attribute::Race => "race",
            Attribute::Emotion => "emotion",
        }
    }

    /// Label set of a categorical attribute; `None` for scalar attributes
    pub fn labels(&self) -> Option<&'static [&'static str]> {
        match self {
            Attribute::Age => None,
            Attribute::Gender => Some(GENDER_LABELS),
            Attribute::Race => Some(RACE_LABELS),
            Attribute::Emotion => Some(EMOTION_LABELS),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "age" => Ok(Attribute::Age),
            "gender" => Ok(Attribute::Gender),
            "race" => Ok(Attribute::Race),
            "emotion" => Ok(Attribute::Emotion),
            other => Err(AnalysisError::UnsupportedAttribute(other.to_string())),
        }
    }
}

impl Serialize for Attribute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Ordered, duplicate-free set of requested attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actions(Vec<Attribute>);

impl Actions {
    pub fn all() -> Self {
        Self(Attribute::ALL.to_vec())
    }

    /// Build from attributes, keeping first occurrence order
    pub fn new(attributes: impl IntoIterator<Item = Attribute>) -> Result<Self, AnalysisError> {
        let mut list: Vec<Attribute> = Vec::new();
        for attribute in attributes {
            if !list.contains(&attribute) {
                list.push(attribute);
            }
        }
        if list.is_empty() {
            return Err(AnalysisError::EmptyActions);
        }
        Ok(Self(list))
    }

    /// Parse attribute names; fails on the first unknown name
    pub fn parse<I, S>(names: I) -> Result<Self, AnalysisError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let attributes = names
            .into_iter()
            .map(|name| name.as_ref().parse::<Attribute>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(attributes)
    }

    pub fn contains(&self, attribute: Attribute) -> bool {
        self.0.contains(&attribute)
    }

    pub fn iter(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Actions {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_round_trip_names() {
        for attribute in Attribute::ALL {
            assert_eq!(attribute.as_str().parse::<Attribute>().unwrap(), attribute);
        }
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let err = "ethnicity".parse::<Attribute>().unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedAttribute(ref name) if name == "ethnicity"));
    }

    #[test]
    fn test_actions_dedup_keeps_first_order() {
        let actions = Actions::parse(["gender", "age", "gender", "emotion", "age"]).unwrap();
        let order: Vec<_> = actions.iter().collect();
        assert_eq!(order, vec![Attribute::Gender, Attribute::Age, Attribute::Emotion]);
        assert!(!actions.contains(Attribute::Race));
    }

    #[test]
    fn test_empty_actions_rejected() {
        let err = Actions::parse(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyActions));
    }

    #[test]
    fn test_actions_parse_fails_on_any_unknown_name() {
        let err = Actions::parse(["age", "mood"]).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedAttribute(ref name) if name == "mood"));
    }

    #[test]
    fn test_label_sets() {
        assert_eq!(Attribute::Age.labels(), None);
        assert_eq!(Attribute::Gender.labels().unwrap(), &["Woman", "Man"]);
        assert_eq!(Attribute::Race.labels().unwrap().len(), 6);
        assert_eq!(Attribute::Emotion.labels().unwrap().len(), 7);
    }
}
