/// Rough token estimate for a piece of text.
///
/// Averages a character-based estimate (about four characters per token,
/// closer for code) with a word-based one (about 0.75 tokens per word,
/// closer for prose).
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as f64 / 4.0;
    let words = text.split_whitespace().count() as f64 * 0.75;
    ((chars + words) / 2.0) as u64
}
