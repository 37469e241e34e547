use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::{DATE_FORMAT, GuestDetails};

const FIRST_NAME_MIN_LEN: usize = 3;

/// Field-level validation failures, keyed by form field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationError {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields.entry(field.to_string()).or_default().push(message.into());
    }

    /// First message recorded for `field`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|m| m.first()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Guest fields as posted by the booking form, untrimmed and unchecked.
#[derive(Debug, Clone, Default)]
pub struct GuestForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl GuestForm {
    pub fn validate(&self) -> Result<GuestDetails, ValidationError> {
        let mut errors = ValidationError::default();
        let first_name = self.first_name.trim();
        let last_name = self.last_name.trim();
        let email = self.email.trim();
        let phone = self.phone.trim();

        for (field, value) in [
            ("first_name", first_name),
            ("last_name", last_name),
            ("email", email),
            ("phone", phone),
        ] {
            if value.is_empty() {
                errors.add(field, "This field cannot be blank");
            }
        }
        if first_name.chars().count() < FIRST_NAME_MIN_LEN {
            errors.add(
                "first_name",
                format!("This field must be at least {FIRST_NAME_MIN_LEN} characters long"),
            );
        }
        if !is_email(email) {
            errors.add("email", "Invalid email address");
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(GuestDetails {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
        })
    }
}

/// Admin login credentials as posted.
#[derive(Debug, Clone, Default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

impl LoginForm {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::default();
        let email = self.email.trim();
        if email.is_empty() {
            errors.add("email", "This field cannot be blank");
        } else if !is_email(email) {
            errors.add("email", "Invalid email address");
        }
        if self.password.is_empty() {
            errors.add("password", "This field cannot be blank");
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Syntactic address check: one `@`, a non-empty local part, and a dotted
/// domain whose labels are alphanumeric or hyphen.
fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || s.chars().any(char::is_whitespace) {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Parse a `YYYY-MM-DD` form value into a date, reporting failures against
/// `field`.
pub fn parse_form_date(field: &str, value: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
        let mut errors = ValidationError::default();
        errors.add(field, "Invalid date");
        errors
    })
}
