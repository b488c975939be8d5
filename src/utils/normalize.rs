//! Text, phone, URL and name normalisation shared by the classifier, the sink and reconciliation.

/// Lower-case and collapse every whitespace run into a single space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep only the digits of a phone number. Returns `None` when fewer than 7 digits remain.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    // Drop a leading US country code so "+1 305..." and "305..." agree
    if digits.len() == 11 && digits.starts_with('1') {
        return Some(digits[1..].to_string());
    }
    Some(digits)
}

/// Build the `name|city` key used when neither URL nor phone is available
pub fn name_city_key(name: &str, city: &str) -> Option<String> {
    let name = normalize_text(name);
    let city = normalize_text(city);
    if name.is_empty() {
        return None;
    }
    Some(format!("{}|{}", name, city))
}

/// Turn a raw website cell into a fetchable URL.
///
/// Spreadsheet exports write missing values as `None`, `nan` or `null`; those yield `None`.
/// A bare host gets an `https://` scheme.
pub fn clean_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if matches!(trimmed.to_lowercase().as_str(), "none" | "nan" | "null" | "n/a") {
        return None;
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    url::Url::parse(&with_scheme).ok().map(|u| u.to_string())
}

/// Reduce a URL to a comparison key: no scheme, no `www.`, no trailing slash, lower-case
pub fn url_key(raw: &str) -> Option<String> {
    let cleaned = clean_url(raw)?;
    let lowered = cleaned.to_lowercase();
    let without_scheme = lowered
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let without_www = without_scheme.trim_start_matches("www.");
    let key = without_www.trim_end_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Deduplication key: URL first, then phone digits, then `name|city`.
///
/// Each kind is prefixed so that a phone number can never collide with a URL key.
pub fn natural_key(
    url: Option<&str>,
    phone: Option<&str>,
    name: &str,
    city: &str,
) -> Option<String> {
    if let Some(key) = url.and_then(url_key) {
        return Some(format!("url:{}", key));
    }
    if let Some(digits) = phone.and_then(normalize_phone) {
        return Some(format!("phone:{}", digits));
    }
    name_city_key(name, city).map(|key| format!("name:{}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Animal-Assisted\n\tTherapy  "), "animal-assisted therapy");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("(305) 273-1263"), Some("3052731263".to_string()));
        assert_eq!(normalize_phone("+1 305.273.1263"), Some("3052731263".to_string()));
        assert_eq!(normalize_phone("ext 12"), None);
    }

    #[test]
    fn test_clean_url() {
        assert_eq!(clean_url("nan"), None);
        assert_eq!(clean_url("None"), None);
        assert_eq!(clean_url("bridgeway.tv"), Some("https://bridgeway.tv/".to_string()));
        assert_eq!(
            clean_url("http://www.FBCWindermere.com"),
            Some("http://www.fbcwindermere.com/".to_string())
        );
    }

    #[test]
    fn test_url_key_ignores_scheme_and_www() {
        assert_eq!(url_key("https://www.Bridgeway.tv/"), url_key("http://bridgeway.tv"));
        assert_eq!(url_key("crosslifechurch.com/kids/"), Some("crosslifechurch.com/kids".to_string()));
    }

    #[test]
    fn test_name_city_key() {
        assert_eq!(
            name_city_key(" Alpha  Omega Church", "MIAMI"),
            Some("alpha omega church|miami".to_string())
        );
        assert_eq!(name_city_key("", "Miami"), None);
    }

    #[test]
    fn test_natural_key_preference() {
        assert_eq!(
            natural_key(Some("www.hope.org/"), Some("305-555-0100"), "Hope", "Miami"),
            Some("url:hope.org".to_string())
        );
        assert_eq!(
            natural_key(Some("nan"), Some("305-555-0100"), "Hope", "Miami"),
            Some("phone:3055550100".to_string())
        );
        assert_eq!(
            natural_key(None, Some("n/a"), "  Hope  Church", "Miami"),
            Some("name:hope church|miami".to_string())
        );
        assert_eq!(natural_key(None, None, "", "Miami"), None);
    }
}
