//! Matrix endpoint records: sources, destinations and their ties.

use avroom_common::{ParseEnumError, RouteInfo};
use std::fmt;
use std::str::FromStr;

/// Input number reserved for "no source"
pub const BLANK_INPUT: u16 = 0;

const UNREGISTERED_PREFIX: &str = "UNREGISTERED:";

/// A matrix input endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub name: String,
    /// Icon classifier shown next to the source on panels (e.g. "pc", "laptop", "camera")
    pub icon: String,
    pub input: u16,
    /// Control page for basic source control, if the source has one
    pub source_control_page: Option<String>,
    /// Control page for advanced source control
    pub advanced_control_page: Option<String>,
}

impl Source {
    /// The sentinel source bound to input 0
    pub fn blank() -> Self {
        Self {
            id: "BLANK".to_string(),
            name: "None".to_string(),
            icon: "blank".to_string(),
            input: BLANK_INPUT,
            source_control_page: None,
            advanced_control_page: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.input == BLANK_INPUT
    }

    /// Placeholder for an input the switch reports but no device is registered on
    pub fn unregistered(input: u16) -> Self {
        Self {
            id: format!("{}{}", UNREGISTERED_PREFIX, input),
            name: format!("Input {}", input),
            icon: "unknown".to_string(),
            input,
            source_control_page: None,
            advanced_control_page: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.id.starts_with(UNREGISTERED_PREFIX)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (in {})", self.name, self.input)
    }
}

/// Physical kind of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationType {
    /// Projector
    Projector,
    /// Projector with a motorised screen
    ProjectorWithScreen,
    /// Flat-panel monitor
    Monitor,
    /// Confidence monitor facing the presenter
    Confidence,
    /// Ceiling-mounted confidence monitor
    CeilingConfidence,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::Projector => "proj",
            DestinationType::ProjectorWithScreen => "proj+scn",
            DestinationType::Monitor => "mon",
            DestinationType::Confidence => "conf",
            DestinationType::CeilingConfidence => "c-conf",
        }
    }
}

impl FromStr for DestinationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proj" => Ok(DestinationType::Projector),
            "proj+scn" => Ok(DestinationType::ProjectorWithScreen),
            "mon" => Ok(DestinationType::Monitor),
            "conf" => Ok(DestinationType::Confidence),
            "c-conf" => Ok(DestinationType::CeilingConfidence),
            _ => Err(ParseEnumError {
                kind: "destination type",
                value: s.to_string(),
            }),
        }
    }
}

/// Sources currently tied to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixTie {
    pub video: Source,
    pub audio: Source,
}

impl MatrixTie {
    pub fn blank() -> Self {
        Self {
            video: Source::blank(),
            audio: Source::blank(),
        }
    }
}

/// A matrix output endpoint, usually a display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
    pub name: String,
    pub output: u16,
    pub kind: DestinationType,
    /// Source this destination shows while the room is in group work
    pub group_work_source: Source,
    /// Projection screen device lowered with this destination, if any
    pub screen: Option<String>,
    /// Destination whose power state this one mirrors
    pub confidence_follow: Option<String>,
    assigned: MatrixTie,
}

impl Destination {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        output: u16,
        kind: DestinationType,
        group_work_source: Source,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            output,
            kind,
            group_work_source,
            screen: None,
            confidence_follow: None,
            assigned: MatrixTie::blank(),
        }
    }

    /// Sources this destination was last seen tied to
    pub fn assigned(&self) -> &MatrixTie {
        &self.assigned
    }

    pub(crate) fn assign(&mut self, tie: MatrixTie) {
        self.assigned = tie;
    }

    pub fn route_info(&self, tie: &MatrixTie) -> RouteInfo {
        RouteInfo {
            destination_id: self.id.clone(),
            destination_name: self.name.clone(),
            output: self.output,
            video_source: tie.video.id.clone(),
            audio_source: tie.audio.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_source() {
        let blank = Source::blank();
        assert!(blank.is_blank());
        assert_eq!(blank.input, BLANK_INPUT);
        assert_eq!(MatrixTie::blank().video, blank);
        assert!(blank.is_registered());
    }

    #[test]
    fn test_unregistered_source() {
        let source = Source::unregistered(9);
        assert_eq!(source.input, 9);
        assert!(!source.is_blank());
        assert!(!source.is_registered());
        assert_eq!(source.to_string(), "Input 9 (in 9)");
    }

    #[test]
    fn test_destination_type_names() {
        for kind in [
            DestinationType::Projector,
            DestinationType::ProjectorWithScreen,
            DestinationType::Monitor,
            DestinationType::Confidence,
            DestinationType::CeilingConfidence,
        ] {
            assert_eq!(kind.as_str().parse::<DestinationType>().unwrap(), kind);
        }
        assert!("tv".parse::<DestinationType>().is_err());
    }

    #[test]
    fn test_new_destination_starts_blank() {
        let dest = Destination::new("MON001", "Side Monitor", 2, DestinationType::Monitor, Source::blank());
        assert_eq!(dest.assigned(), &MatrixTie::blank());
    }
}
