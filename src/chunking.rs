/// A contiguous chunk of text extracted from a source file, ready for
/// indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// The chunk text.
    pub text: String,
    /// 1-based start line in the original file (inclusive).
    pub start_line: u32,
    /// 1-based end line in the original file (inclusive).
    pub end_line: u32,
    /// Approximate token count (whitespace-split heuristic).
    pub token_count: u32,
}

/// A word with the 1-based line it came from.
#[derive(Debug, Clone, Copy)]
struct Word<'a> {
    text: &'a str,
    line: u32,
}

/// Split `content` into chunks of approximately `max_tokens` tokens with
/// `overlap` tokens of trailing context carried into the next chunk.
///
/// Splitting prefers markdown structure boundaries: blank-line separated
/// paragraphs, ATX headings, and fenced code blocks are kept whole where
/// possible. An oversized fence splits at line boundaries, an oversized
/// paragraph at word granularity. The tokenisation is a whitespace word
/// count — good enough for chunking decisions without a real tokeniser.
///
/// Line numbers are tracked per word so that search results can cite the
/// original file location. Identical input and parameters always produce
/// identical chunks; the indexing pipeline relies on this for idempotent
/// re-indexing.
pub fn chunk_text(content: &str, max_tokens: u32, overlap: u32) -> Vec<TextChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let max_tokens = max_tokens.max(1) as usize;
    let overlap = (overlap as usize).min(max_tokens.saturating_sub(1));

    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current: Vec<Word> = Vec::new();
    // Words at the front of `current` carried over from the previous chunk.
    let mut carried = 0usize;

    let mut flush = |current: &mut Vec<Word>, carried: &mut usize| {
        if current.is_empty() {
            return;
        }
        chunks.push(render_chunk(current));
        let keep_from = current.len().saturating_sub(overlap);
        let tail = current.split_off(keep_from);
        *current = tail;
        *carried = current.len();
    };

    for block in split_blocks(content) {
        let has_own_words = current.len() > carried;
        if has_own_words && current.len() + block.words.len() > max_tokens {
            flush(&mut current, &mut carried);
        }

        if block.words.len() <= max_tokens {
            current.extend_from_slice(&block.words);
            if current.len() >= max_tokens {
                flush(&mut current, &mut carried);
            }
        } else if block.fence {
            // An oversized code fence splits at line boundaries only.
            let mut i = 0;
            while i < block.words.len() {
                let line = block.words[i].line;
                while i < block.words.len() && block.words[i].line == line {
                    current.push(block.words[i]);
                    i += 1;
                }
                if current.len() >= max_tokens {
                    flush(&mut current, &mut carried);
                }
            }
        } else {
            // An oversized paragraph splits at word granularity.
            for &word in &block.words {
                current.push(word);
                if current.len() >= max_tokens {
                    flush(&mut current, &mut carried);
                }
            }
        }
    }

    if current.len() > carried || (chunks.is_empty() && !current.is_empty()) {
        chunks.push(render_chunk(&current));
    }

    chunks
}

/// Materialise a chunk from accumulated words, re-joining words on the same
/// source line with spaces and lines with newlines.
fn render_chunk(words: &[Word]) -> TextChunk {
    let mut text = String::new();
    let mut last_line = 0u32;
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            text.push(if word.line == last_line { ' ' } else { '\n' });
        }
        text.push_str(word.text);
        last_line = word.line;
    }
    TextChunk {
        text,
        start_line: words[0].line,
        end_line: words[words.len() - 1].line,
        token_count: words.len() as u32,
    }
}

/// A structural block: words with line numbers, plus whether the block is a
/// fenced code block (which constrains how it may be split).
struct Block<'a> {
    words: Vec<Word<'a>>,
    fence: bool,
}

/// Split content into structural blocks: fenced code blocks (delimiters
/// included), ATX headings, and blank-line separated paragraphs.
fn split_blocks<'a>(content: &'a str) -> Vec<Block<'a>> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut paragraph: Vec<Word> = Vec::new();
    let mut fence: Option<(char, usize, Vec<Word>)> = None;

    let close_paragraph = |paragraph: &mut Vec<Word<'a>>, blocks: &mut Vec<Block<'a>>| {
        if !paragraph.is_empty() {
            blocks.push(Block {
                words: std::mem::take(paragraph),
                fence: false,
            });
        }
    };

    for (idx, line) in content.lines().enumerate() {
        let line_no = (idx as u32) + 1;
        let trimmed = line.trim_start();

        if let Some((fence_char, fence_len, ref mut words)) = fence {
            push_line_words(words, line, line_no);
            if is_fence_delimiter(trimmed, Some((fence_char, fence_len))) {
                blocks.push(Block {
                    words: std::mem::take(words),
                    fence: true,
                });
                fence = None;
            }
            continue;
        }

        if let Some((fence_char, fence_len)) = parse_fence_open(trimmed) {
            close_paragraph(&mut paragraph, &mut blocks);
            let mut words = Vec::new();
            push_line_words(&mut words, line, line_no);
            fence = Some((fence_char, fence_len, words));
            continue;
        }

        if trimmed.is_empty() {
            close_paragraph(&mut paragraph, &mut blocks);
            continue;
        }

        if is_heading(trimmed) {
            close_paragraph(&mut paragraph, &mut blocks);
            let mut words = Vec::new();
            push_line_words(&mut words, line, line_no);
            blocks.push(Block {
                words,
                fence: false,
            });
            continue;
        }

        push_line_words(&mut paragraph, line, line_no);
    }

    // Unterminated fence or trailing paragraph.
    if let Some((_, _, words)) = fence {
        if !words.is_empty() {
            blocks.push(Block {
                words,
                fence: true,
            });
        }
    }
    close_paragraph(&mut paragraph, &mut blocks);

    blocks.retain(|b| !b.words.is_empty());
    blocks
}

fn push_line_words<'a>(words: &mut Vec<Word<'a>>, line: &'a str, line_no: u32) {
    for text in line.split_whitespace() {
        words.push(Word { text, line: line_no });
    }
}

fn is_heading(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map_or(true, |c| c == ' ' || c == '\t')
}

/// Returns the fence character and length when `trimmed` opens a fenced
/// code block (``` or ~~~, three or more).
fn parse_fence_open(trimmed: &str) -> Option<(char, usize)> {
    for fence_char in ['`', '~'] {
        let len = trimmed.chars().take_while(|&c| c == fence_char).count();
        if len >= 3 {
            return Some((fence_char, len));
        }
    }
    None
}

/// Whether `trimmed` closes a fence opened with `open` (same character, at
/// least the opening length, nothing else on the line).
fn is_fence_delimiter(trimmed: &str, open: Option<(char, usize)>) -> bool {
    let Some((fence_char, fence_len)) = open else {
        return false;
    };
    let len = trimmed.chars().take_while(|&c| c == fence_char).count();
    len >= fence_len && trimmed[len..].trim().is_empty()
}
