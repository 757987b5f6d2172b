//! Splitting long text into transport-sized messages.

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Pieces break on line boundaries; a single line longer than the limit is
/// hard-split.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    // Distinguishes an empty chunk from one holding a single blank line.
    let mut open = false;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        // +1 for the newline that rejoins this line to `current`.
        let needed = if open { line_len + 1 } else { line_len };

        if current_len + needed <= max_chars {
            if open {
                current.push('\n');
            }
            current.push_str(line);
            current_len += needed;
            open = true;
            continue;
        }

        if open {
            chunks.push(std::mem::take(&mut current));
        }

        if line_len <= max_chars {
            current.push_str(line);
            current_len = line_len;
            open = true;
            continue;
        }

        // Oversized line: hard-split on char boundaries.
        let chars: Vec<char> = line.chars().collect();
        let mut pieces = chars.chunks(max_chars).peekable();
        while let Some(piece) = pieces.next() {
            let piece: String = piece.iter().collect();
            if pieces.peek().is_some() {
                chunks.push(piece);
            } else {
                current_len = piece.chars().count();
                current = piece;
                open = true;
            }
        }
    }

    if open {
        chunks.push(current);
    }
    chunks
}
