//! Localized price text → number.
//!
//! Listings render prices as `12.500,50 TL`: dot thousands separators, comma
//! decimal separator, trailing currency marker.

/// Parses rendered price strings using a fixed currency marker.
#[derive(Debug, Clone)]
pub struct PriceParser {
    currency_marker: String,
}

impl PriceParser {
    pub fn new(currency_marker: impl Into<String>) -> Self {
        Self {
            currency_marker: currency_marker.into(),
        }
    }

    /// The currency marker this parser strips.
    pub fn currency_marker(&self) -> &str {
        &self.currency_marker
    }

    /// Parse a price, coercing anything unparsable to `0.0`.
    ///
    /// A malformed price must never abort a crawl, so failures are not
    /// reported here. Callers that need to tell a real zero from a failure
    /// use [`PriceParser::parse_checked`].
    pub fn parse(&self, text: &str) -> f64 {
        self.parse_checked(text).unwrap_or(0.0)
    }

    /// Parse a price, returning `None` for empty, malformed, negative, or
    /// non-finite input.
    pub fn parse_checked(&self, text: &str) -> Option<f64> {
        let trimmed = text.trim();
        let amount = trimmed
            .strip_suffix(self.currency_marker.as_str())
            .unwrap_or(trimmed);

        let cleaned: String = amount
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '.')
            .map(|c| if c == ',' { '.' } else { c })
            .collect();

        if cleaned.is_empty() {
            return None;
        }

        let value: f64 = cleaned.parse().ok()?;
        (value.is_finite() && value >= 0.0).then_some(value)
    }

    /// First line that carries the currency marker, i.e. the rendered price.
    pub fn find_price_line<'a>(&self, lines: &[&'a str]) -> Option<&'a str> {
        lines
            .iter()
            .copied()
            .find(|line| line.contains(self.currency_marker.as_str()))
    }
}

impl Default for PriceParser {
    fn default() -> Self {
        Self::new("TL")
    }
}
