//! Topic construction and sanitization.
//!
//! MQTT topic grammar reserves `+` and `#` as wildcards and `/` as the level
//! separator; spaces are legal but hostile to downstream tooling. All four
//! are replaced with underscores before a value lands in a topic.

/// Replace characters disallowed in a topic level with underscores.
pub fn sanitize_topic_part(value: &str) -> String {
    value.trim().replace(['/', ' ', '+', '#'], "_")
}

/// Render a topic template, substituting `$host`, `$device`, and `$metric`
/// with sanitized values.
pub fn render_topic(template: &str, host: &str, device: &str, metric: &str) -> String {
    template
        .replace("$host", &sanitize_topic_part(host))
        .replace("$device", &sanitize_topic_part(device))
        .replace("$metric", &sanitize_topic_part(metric))
}

/// Join non-empty parts into a topic path, sanitizing each level.
pub fn build_topic(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .map(|part| sanitize_topic_part(part))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_topic_part("a/b c+d#e"), "a_b_c_d_e");
        assert_eq!(sanitize_topic_part("  padded  "), "padded");
    }

    #[test]
    fn render_substitutes_sanitized_placeholders() {
        let topic = render_topic("metrics/$host/$device/$metric", "h 1", "cpu", "usage");
        assert_eq!(topic, "metrics/h_1/cpu/usage");
    }

    #[test]
    fn render_with_empty_parts() {
        let topic = render_topic("status/$host", "node-a", "", "");
        assert_eq!(topic, "status/node-a");
    }

    #[test]
    fn build_topic_skips_empty_parts() {
        assert_eq!(
            build_topic(&["metrics", "docker", "", "web", "$info"]),
            "metrics/docker/web/$info"
        );
    }
}
