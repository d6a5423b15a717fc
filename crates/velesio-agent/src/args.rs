//! Shell-word splitting for the free-form worker arguments.
//!
//! POSIX quoting rules without any expansion; nothing here ever reaches a
//! shell.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("unterminated single quote")]
    UnterminatedSingle,
    #[error("unterminated double quote")]
    UnterminatedDouble,
    #[error("trailing backslash")]
    TrailingEscape,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plain,
    Single,
    Double,
}

pub fn split_args(input: &str) -> Result<Vec<String>, SplitError> {
    let mut out = Vec::new();
    let mut word = String::new();
    // Distinguishes `''` (an empty argument) from no argument at all.
    let mut in_word = false;
    let mut mode = Mode::Plain;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match mode {
            Mode::Plain => match c {
                c if c.is_whitespace() => {
                    if in_word {
                        out.push(std::mem::take(&mut word));
                        in_word = false;
                    }
                }
                '\'' => {
                    mode = Mode::Single;
                    in_word = true;
                }
                '"' => {
                    mode = Mode::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    // Line continuation.
                    Some('\n') => {}
                    Some(next) => {
                        word.push(next);
                        in_word = true;
                    }
                    None => return Err(SplitError::TrailingEscape),
                },
                c => {
                    word.push(c);
                    in_word = true;
                }
            },
            Mode::Single => match c {
                '\'' => mode = Mode::Plain,
                c => word.push(c),
            },
            Mode::Double => match c {
                '"' => mode = Mode::Plain,
                '\\' => match chars.next() {
                    Some('\n') => {}
                    Some(next @ ('\\' | '"' | '$' | '`')) => word.push(next),
                    Some(next) => {
                        word.push('\\');
                        word.push(next);
                    }
                    None => return Err(SplitError::UnterminatedDouble),
                },
                c => word.push(c),
            },
        }
    }

    match mode {
        Mode::Single => return Err(SplitError::UnterminatedSingle),
        Mode::Double => return Err(SplitError::UnterminatedDouble),
        Mode::Plain => {}
    }
    if in_word {
        out.push(word);
    }
    Ok(out)
}
