//! Utility functions and helpers

pub mod time;

/// Collapse a full stack into the `a;b;c` form used by folded-stack tools
pub fn fold_names<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut folded = String::new();
    for (idx, name) in names.into_iter().enumerate() {
        if idx > 0 {
            folded.push(';');
        }
        // Separators inside names would split the frame
        folded.extend(name.as_ref().chars().map(|c| match c {
            ';' => ':',
            ' ' => '_',
            c => c,
        }));
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_names() {
        assert_eq!(fold_names(["Main", "Run", "Work"]), "Main;Run;Work");
        assert_eq!(fold_names(Vec::<String>::new()), "");
    }

    #[test]
    fn test_fold_names_escapes_separators() {
        assert_eq!(fold_names(["A;B", "C D"]), "A:B;C_D");
    }
}
