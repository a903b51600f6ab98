/// Join URL path segments with exactly one `/` between them.
///
/// Every segment is trimmed of leading and trailing slashes first, and
/// segments that end up empty are skipped entirely, so `"/foo/"`, `"foo"`
/// and `"/foo"` all contribute the same `/foo`. An unset practice id
/// therefore never leaves a `//` behind.
pub fn join_path<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut joined = String::new();
    for segment in segments {
        let trimmed = segment.as_ref().trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        joined.push('/');
        joined.push_str(trimmed);
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}
