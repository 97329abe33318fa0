/// Checks keyword groups against a response.
///
/// Groups are tried in order and the first group whose keywords all appear
/// (case-insensitively) in the response wins with score 1.0. An empty response
/// scores 0.0 without looking at the groups.
pub fn evaluate_keywords(groups: &[Vec<String>], response: &str) -> (f64, String) {
    if response.trim().is_empty() {
        return (
            0.0,
            "No response provided for keywords eval evaluation".to_string(),
        );
    }

    let haystack = response.to_lowercase();

    for (index, group) in groups.iter().enumerate() {
        let (matched, unmatched) = split_keywords(group, &haystack);
        if unmatched.is_empty() {
            return (
                1.0,
                format!(
                    "Keywords eval successful: Option {} - all keywords matched: {}",
                    index + 1,
                    quote_list(&matched)
                ),
            );
        }
    }

    let details: Vec<String> = groups
        .iter()
        .enumerate()
        .filter_map(|(index, group)| {
            let (matched, unmatched) = split_keywords(group, &haystack);
            if unmatched.is_empty() {
                return None;
            }
            let matched = if matched.is_empty() {
                "none".to_string()
            } else {
                quote_list(&matched)
            };
            Some(format!(
                "Option {}: unmatched [{}], matched [{}]",
                index + 1,
                quote_list(&unmatched),
                matched
            ))
        })
        .collect();

    (
        0.0,
        format!(
            "Keywords eval failed: All options failed - {}",
            details.join("; ")
        ),
    )
}

fn split_keywords<'a>(group: &'a [String], haystack: &str) -> (Vec<&'a str>, Vec<&'a str>) {
    group
        .iter()
        .map(String::as_str)
        .partition(|keyword| haystack.contains(&keyword.to_lowercase()))
}

fn quote_list(keywords: &[&str]) -> String {
    keywords
        .iter()
        .map(|keyword| format!("'{keyword}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
