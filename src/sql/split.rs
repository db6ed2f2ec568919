/// Splits a SQL script on `;`, ignoring separators inside quotes and comments.
///
/// Handles `'..'`, `".."` and backtick quoting with backslash escapes, `-- ..` and
/// `# ..` line comments, and `/* .. */` block comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => skip_line(&mut chars, &mut current),
            '#' => skip_line(&mut chars, &mut current),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for c in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
                current.push(' ');
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

/// Drops a line comment, keeping its newline so the surrounding tokens stay apart.
fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, current: &mut String) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
    current.push('\n');
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}
