use std::env;
use std::fs;
use std::io::IsTerminal;

use jisp_vm::{Program, Signal};
use serde_json::Value;

// ANSI color codes for the JSON dump.
const RESET: &str = "\x1b[0m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";

fn print_usage() {
    eprintln!("jisp - a JSON-native stack language interpreter");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  jisp <program.json>    Run a program document and print the final state");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        print_usage();
        std::process::exit(0);
    }
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V" || args[1] == "-v") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let text = match fs::read_to_string(&args[1]) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error reading file: {err}");
            std::process::exit(1);
        }
    };

    // A bare `{"code": [...]}` and a full saved state object both load here.
    let mut program: Program = match serde_json::from_str(&text) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("error parsing program: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = program.process_imports() {
        eprintln!("error processing imports: {err}");
        std::process::exit(1);
    }

    // Start execution only if the document does not already carry an error.
    if program.error.is_none() {
        let code = program.code.clone();
        if let Err(signal) = program.execute_frame(code, vec![Value::from("code")], false, -1) {
            // Exit ends the program successfully; break/continue escaping
            // the root is a fatal condition, recorded on the document.
            if signal != Signal::Exit {
                program.set_fatal_error(signal.to_string());
            }
        }
    }

    let output = match serde_json::to_string_pretty(&program) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error serializing final state: {err}");
            std::process::exit(1);
        }
    };

    if std::io::stdout().is_terminal() {
        println!("{}", colorize_json(&output));
    } else {
        println!("{output}");
    }

    if program.error.is_some() {
        std::process::exit(1);
    }
}

/// Walk the rendered JSON and wrap tokens in ANSI colors: keys green, string
/// values yellow, numbers magenta, booleans blue, null red, brackets cyan.
/// Operates on bytes; string contents are copied through untouched, so the
/// colorized output differs from the plain dump only by escape sequences.
fn colorize_json(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len() * 2);
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];

        if in_string {
            if ch == b'"' && !is_escaped(bytes, i) {
                in_string = false;
                out.push(ch);
                out.extend_from_slice(RESET.as_bytes());
                i += 1;
                continue;
            }
            out.push(ch);
            i += 1;
            continue;
        }

        match ch {
            b'"' => {
                in_string = true;
                if is_key_at(bytes, i) {
                    out.extend_from_slice(GREEN.as_bytes());
                } else {
                    out.extend_from_slice(YELLOW.as_bytes());
                }
                out.push(ch);
                i += 1;
            }
            b'{' | b'}' | b'[' | b']' => {
                out.extend_from_slice(CYAN.as_bytes());
                out.push(ch);
                out.extend_from_slice(RESET.as_bytes());
                i += 1;
            }
            b'0'..=b'9' | b'-' => {
                out.extend_from_slice(MAGENTA.as_bytes());
                while i < bytes.len() && matches!(bytes[i], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-') {
                    out.push(bytes[i]);
                    i += 1;
                }
                out.extend_from_slice(RESET.as_bytes());
            }
            _ if bytes[i..].starts_with(b"true") => {
                out.extend_from_slice(BLUE.as_bytes());
                out.extend_from_slice(b"true");
                out.extend_from_slice(RESET.as_bytes());
                i += 4;
            }
            _ if bytes[i..].starts_with(b"false") => {
                out.extend_from_slice(BLUE.as_bytes());
                out.extend_from_slice(b"false");
                out.extend_from_slice(RESET.as_bytes());
                i += 5;
            }
            _ if bytes[i..].starts_with(b"null") => {
                out.extend_from_slice(RED.as_bytes());
                out.extend_from_slice(b"null");
                out.extend_from_slice(RESET.as_bytes());
                i += 4;
            }
            _ => {
                out.push(ch);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| data.to_string())
}

/// Whether the quote at `index` is escaped by an odd run of backslashes.
fn is_escaped(bytes: &[u8], index: usize) -> bool {
    let mut backslashes = 0;
    let mut k = index;
    while k > 0 && bytes[k - 1] == b'\\' {
        backslashes += 1;
        k -= 1;
    }
    backslashes % 2 == 1
}

/// Whether the string opening at `index` is an object key: scan past the
/// closing quote and any whitespace, and look for a colon.
fn is_key_at(bytes: &[u8], index: usize) -> bool {
    let mut j = index + 1;
    while j < bytes.len() {
        if bytes[j] == b'"' && !is_escaped(bytes, j) {
            j += 1;
            break;
        }
        j += 1;
    }
    while j < bytes.len() && matches!(bytes[j], b' ' | b'\t' | b'\n' | b'\r') {
        j += 1;
    }
    j < bytes.len() && bytes[j] == b':'
}

#[cfg(test)]
mod tests {
    use super::{colorize_json, is_escaped, is_key_at};

    fn strip_ansi(input: &str) -> String {
        let mut out = String::new();
        let mut chars = input.chars();
        while let Some(ch) = chars.next() {
            if ch == '\x1b' {
                for next in chars.by_ref() {
                    if next == 'm' {
                        break;
                    }
                }
                continue;
            }
            out.push(ch);
        }
        out
    }

    #[test]
    fn colorizing_preserves_the_json_text() {
        let doc = r#"{
  "stack": [1, -2.5, true, false, null],
  "variables": {"name": "va\"lue", "nested": {"k": []}}
}"#;
        assert_eq!(strip_ansi(&colorize_json(doc)), doc);
    }

    #[test]
    fn keys_and_values_get_different_colors() {
        let colored = colorize_json(r#"{"key": "value"}"#);
        assert!(colored.contains("\x1b[32m\"key\""));
        assert!(colored.contains("\x1b[33m\"value\""));
    }

    #[test]
    fn literals_and_numbers_are_colored() {
        let colored = colorize_json(r#"[12, true, null]"#);
        assert!(colored.contains("\x1b[35m12"));
        assert!(colored.contains("\x1b[34mtrue"));
        assert!(colored.contains("\x1b[31mnull"));
    }

    #[test]
    fn escaped_quotes_stay_inside_strings() {
        let bytes = br#""a\"b""#;
        assert!(is_escaped(bytes, 3));
        assert!(!is_escaped(bytes, 5));

        let doc = r#"{"a": "x\"y"}"#;
        assert_eq!(strip_ansi(&colorize_json(doc)), doc);
    }

    #[test]
    fn key_detection_skips_whitespace() {
        let bytes = br#"{"spaced"  : 1}"#;
        assert!(is_key_at(bytes, 1));
        let bytes = br#"["plain"]"#;
        assert!(!is_key_at(bytes, 1));
    }
}
