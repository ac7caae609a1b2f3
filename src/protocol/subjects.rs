//! Subject construction and token validation
//!
//! Device push subjects have the form `<namespace>.<account_code>.<device_id>`.
//! Each token must be non-empty and must not contain the subject separator,
//! whitespace or the broker wildcards `*` and `>`.

use thiserror::Error;

pub fn device_subject(
    namespace: &str,
    account_code: &str,
    device_id: &str,
) -> Result<String, SubjectError> {
    validate_subject_token(namespace)?;
    validate_subject_token(account_code)?;
    validate_subject_token(device_id)?;

    Ok(format!("{namespace}.{account_code}.{device_id}"))
}

pub fn validate_subject_token(token: &str) -> Result<(), SubjectError> {
    if token.is_empty() {
        return Err(SubjectError::EmptyToken);
    }

    for ch in token.chars() {
        if ch == '.' || ch == '*' || ch == '>' || ch.is_whitespace() || ch.is_control() {
            return Err(SubjectError::InvalidTokenChar(ch));
        }
    }

    Ok(())
}

/// Subject validation errors
#[derive(Debug, Error, PartialEq)]
pub enum SubjectError {
    #[error("Subject token cannot be empty")]
    EmptyToken,
    #[error("Subject token contains invalid character: {0:?}")]
    InvalidTokenChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_device_subject_layout() {
        let subject = device_subject("APKLIS_DEVICES_TEST", "acct42", "dev-7").unwrap();
        assert_eq!(subject, "APKLIS_DEVICES_TEST.acct42.dev-7");
    }

    #[test]
    fn test_rejects_separator_inside_token() {
        assert_eq!(
            device_subject("NS", "a.b", "dev"),
            Err(SubjectError::InvalidTokenChar('.'))
        );
    }

    #[test]
    fn test_rejects_wildcards_and_whitespace() {
        assert_eq!(
            validate_subject_token("dev*"),
            Err(SubjectError::InvalidTokenChar('*'))
        );
        assert_eq!(
            validate_subject_token("dev>"),
            Err(SubjectError::InvalidTokenChar('>'))
        );
        assert_eq!(
            validate_subject_token("dev 1"),
            Err(SubjectError::InvalidTokenChar(' '))
        );
    }

    #[test]
    fn test_rejects_empty_token() {
        assert_eq!(
            device_subject("NS", "", "dev"),
            Err(SubjectError::EmptyToken)
        );
    }

    proptest! {
        #[test]
        fn valid_tokens_produce_three_part_subjects(
            ns in "[A-Z_]{1,20}",
            code in "[a-zA-Z0-9_-]{1,16}",
            device in "[a-zA-Z0-9_-]{1,32}",
        ) {
            let subject = device_subject(&ns, &code, &device).unwrap();
            let parts: Vec<&str> = subject.split('.').collect();
            prop_assert_eq!(parts, vec![ns.as_str(), code.as_str(), device.as_str()]);
        }

        #[test]
        fn tokens_with_dots_are_rejected(prefix in "[a-z]{0,5}", suffix in "[a-z]{0,5}") {
            let token = format!("{prefix}.{suffix}");
            prop_assert!(validate_subject_token(&token).is_err());
        }
    }
}
