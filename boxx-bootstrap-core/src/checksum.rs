use crc32fast::Hasher;

/// CRC32 of a schema document, fed line by line without line endings.
///
/// A document saved with `\r\n` endings has the same checksum as the `\n`
/// version, so the report does not change when the file moves between
/// platforms.
pub fn calculate_checksum(content: &str) -> u32 {
    let mut hasher = Hasher::new();
    for line in content.lines() {
        hasher.update(line.as_bytes());
    }
    hasher.finalize()
}

/// Render a checksum the way the report prints it.
pub fn format_checksum(checksum: u32) -> String {
    format!("{:08x}", checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_empty() {
        assert_eq!(calculate_checksum(""), 0);
        assert_eq!(format_checksum(0), "00000000");
    }

    #[test]
    fn test_checksum_ignores_line_endings() {
        let unix = "CREATE TABLE settings (id INT);\nINSERT INTO settings VALUES (1);\n";
        let windows = "CREATE TABLE settings (id INT);\r\nINSERT INTO settings VALUES (1);\r\n";
        assert_eq!(calculate_checksum(unix), calculate_checksum(windows));
    }

    #[test]
    fn test_checksum_changes_with_content() {
        assert_ne!(calculate_checksum("SELECT 1;"), calculate_checksum("SELECT 2;"));
    }

    #[test]
    fn test_checksum_is_crc32_of_line_bytes() {
        let content = "CREATE TABLE t (\n  id INT\n);\n";

        let mut expected = Hasher::new();
        expected.update(b"CREATE TABLE t (");
        expected.update(b"  id INT");
        expected.update(b");");

        assert_eq!(calculate_checksum(content), expected.finalize());
    }

    #[test]
    fn test_format_checksum_is_fixed_width_hex() {
        assert_eq!(format_checksum(0xdead), "0000dead");
        assert_eq!(format_checksum(u32::MAX), "ffffffff");
    }
}
