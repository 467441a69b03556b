use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque classroom handle assigned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassroomId(pub String);

impl ClassroomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassroomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Student registration number, unique within a classroom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationNumber(pub String);

impl RegistrationNumber {
    pub fn new(reg_no: impl Into<String>) -> Self {
        Self(reg_no.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistrationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger-addressable identity bound 1:1 to a registration number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Account(pub String);

impl Account {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A classroom as known to the ledger. Names are unique and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classroom {
    pub id: ClassroomId,
    pub name: String,
}

/// An enrolled student. `account` is `None` until the directory binding exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub reg_no: RegistrationNumber,
    pub name: String,
    pub account: Option<Account>,
}

/// One identity guess from the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(alias = "display_name", alias = "name")]
    pub display_name: String,
    #[serde(alias = "registration_number", alias = "reg_no")]
    pub registration_number: RegistrationNumber,
}

impl Candidate {
    pub fn new(display_name: impl Into<String>, reg_no: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            registration_number: RegistrationNumber::new(reg_no),
        }
    }
}

/// A ledger record, as returned by the marked-students read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkedStudent {
    pub account: Account,
    #[serde(default)]
    pub reg_no: Option<RegistrationNumber>,
    #[serde(default)]
    pub marked_at: Option<DateTime<Utc>>,
}

/// Encoding of a still image handed to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    /// File name used when uploading a captured still.
    pub fn file_name(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "captured_face.jpg",
            ImageFormat::Png => "captured_face.png",
        }
    }
}

/// An encoded still frame sampled from the camera.
#[derive(Debug, Clone)]
pub struct StillImage {
    /// Encoded image bytes in `format`.
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    /// Driver buffer sequence number the still was taken from.
    pub sequence: u32,
}

impl StillImage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_structured_schema() {
        let json = r#"{"displayName":"Alice","registrationNumber":"R1"}"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate, Candidate::new("Alice", "R1"));
    }

    #[test]
    fn test_candidate_snake_case_aliases() {
        let json = r#"{"display_name":"Bob","registration_number":"R9"}"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.registration_number.as_str(), "R9");
    }

    #[test]
    fn test_newtypes_serialize_transparently() {
        let json = serde_json::to_string(&Account::new("0xAAA")).unwrap();
        assert_eq!(json, "\"0xAAA\"");
        let id: ClassroomId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn test_image_format_upload_names() {
        assert_eq!(ImageFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(ImageFormat::default().file_name(), "captured_face.jpg");
        assert_eq!(ImageFormat::Png.file_name(), "captured_face.png");
    }
}
