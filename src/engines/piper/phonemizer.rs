use std::borrow::Cow;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::model::PiperError;

/// Location of the espeak-ng binary and its data directory.
#[derive(Debug, Clone, Default)]
pub struct EspeakConfig {
    /// espeak-ng binary. `None` uses `espeak-ng` from PATH.
    pub bin_path: Option<PathBuf>,
    /// The `espeak-ng-data` directory. `None` uses the system default.
    pub data_path: Option<PathBuf>,
}

/// Phonemes of one sentence: IPA characters, word spaces and punctuation.
pub type Sentence = Vec<char>;

const SENTENCE_END: [char; 3] = ['.', '!', '?'];

/// Convert text to per-sentence phoneme sequences via espeak-ng.
///
/// Each returned sentence is synthesized as one chunk, so the split points
/// decide streaming granularity. Sentences that contain only punctuation are
/// dropped.
pub fn phonemize_sentences(
    text: &str,
    voice: &str,
    espeak: &EspeakConfig,
) -> Result<Vec<Sentence>, PiperError> {
    let sentences = split_sentences(split_text_parts(text));

    let segments: Vec<&str> = sentences
        .iter()
        .flatten()
        .filter_map(|part| match part {
            TextPart::Text(segment) => Some(segment.as_str()),
            TextPart::Punct(_) => None,
        })
        .collect();

    if segments.is_empty() {
        return Ok(Vec::new());
    }

    let mut segment_phonemes = phonemize_segments_batch(&segments, voice, espeak)?.into_iter();

    let mut out = Vec::with_capacity(sentences.len());
    for sentence in sentences {
        let mut phonemes: Sentence = Vec::new();
        let mut voiced = false;
        for part in sentence {
            match part {
                TextPart::Text(_) => {
                    let Some(ipa) = segment_phonemes.next() else {
                        continue;
                    };
                    if phonemes.last().is_some_and(|c| *c != ' ') {
                        phonemes.push(' ');
                    }
                    voiced |= !ipa.is_empty();
                    phonemes.extend(ipa);
                }
                TextPart::Punct(ch) => phonemes.push(ch),
            }
        }
        if voiced {
            out.push(phonemes);
        }
    }

    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TextPart {
    Text(String),
    Punct(char),
}

fn split_text_parts(text: &str) -> Vec<TextPart> {
    let mut parts = Vec::new();
    let mut current = String::new();

    for (idx, ch) in text.char_indices() {
        let ch_len = ch.len_utf8();
        if let Some(punct) = map_boundary_punctuation(ch) {
            if !is_numeric_connector_between_digits(text, idx, ch_len, ch) {
                flush_text_part(&mut parts, &mut current);
                parts.push(TextPart::Punct(punct));
                continue;
            }
        }

        if ch.is_whitespace() {
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            continue;
        }

        current.push(ch);
    }

    flush_text_part(&mut parts, &mut current);
    parts
}

/// Group parts into sentences, closing one after each terminal punctuation mark.
fn split_sentences(parts: Vec<TextPart>) -> Vec<Vec<TextPart>> {
    let mut sentences = Vec::new();
    let mut current = Vec::new();

    for part in parts {
        // Leading punctuation carries no prosody for an empty sentence.
        if current.is_empty() && matches!(part, TextPart::Punct(_)) {
            continue;
        }
        let ends_sentence = matches!(part, TextPart::Punct(ch) if SENTENCE_END.contains(&ch));
        current.push(part);
        if ends_sentence {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }

    sentences
}

fn flush_text_part(parts: &mut Vec<TextPart>, current: &mut String) {
    let trimmed = current.trim();
    if trimmed.is_empty() {
        current.clear();
        return;
    }
    parts.push(TextPart::Text(trimmed.to_string()));
    current.clear();
}

fn map_boundary_punctuation(ch: char) -> Option<char> {
    match ch {
        '.' | '!' | '?' | ',' | ';' | ':' | '—' | '…' => Some(ch),
        '\n' | '\r' => Some('.'),
        _ => None,
    }
}

fn is_numeric_connector_between_digits(text: &str, idx: usize, ch_len: usize, ch: char) -> bool {
    if !matches!(ch, '.' | ',') {
        return false;
    }

    let prev = text[..idx].chars().next_back();
    let next = text[idx + ch_len..].chars().next();

    matches!(
        (prev, next),
        (Some(left), Some(right)) if left.is_ascii_digit() && right.is_ascii_digit()
    )
}

fn phonemize_segments_batch(
    segments: &[&str],
    voice: &str,
    espeak: &EspeakConfig,
) -> Result<Vec<Vec<char>>, PiperError> {
    let batched_input = segments.join("\n");
    let output = run_espeak(&batched_input, voice, espeak)?;
    let lines: Vec<&str> = output.lines().collect();

    // espeak-ng should emit one line per input line for stdin mode.
    // If this assumption breaks, fall back to per-segment invocation.
    if lines.len() != segments.len() {
        log::debug!(
            "espeak-ng returned {} lines for {} segments, phonemizing one by one",
            lines.len(),
            segments.len()
        );
        return segments
            .iter()
            .map(|segment| Ok(ipa_chars(&run_espeak(segment, voice, espeak)?)))
            .collect();
    }

    Ok(lines.iter().map(|line| ipa_chars(line)).collect())
}

fn run_espeak(input: &str, voice: &str, espeak: &EspeakConfig) -> Result<String, PiperError> {
    let bin: &Path = espeak
        .bin_path
        .as_deref()
        .unwrap_or_else(|| Path::new("espeak-ng"));

    let mut command = Command::new(bin);
    command.args(["--ipa", "--stdin", "-q", "-v", voice]);
    if let Some(data) = &espeak.data_path {
        // --path names the directory that contains espeak-ng-data.
        let root = data.parent().unwrap_or(data);
        command.arg(format!("--path={}", root.display()));
    }

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PiperError::EspeakNotFound
            } else {
                PiperError::Io(e)
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // espeak-ng treats stdin as line-oriented input; an unterminated last
        // line can lose its final token.
        let stdin_payload = canonicalize_espeak_stdin_payload(input);
        stdin
            .write_all(stdin_payload.as_bytes())
            .map_err(PiperError::Io)?;
    }

    let output = child.wait_with_output().map_err(PiperError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PiperError::PhonemizerFailed(format!(
            "espeak-ng exited with code {:?}: {stderr}",
            output.status.code()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn canonicalize_espeak_stdin_payload(input: &str) -> Cow<'_, str> {
    if input.ends_with('\n') {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(format!("{input}\n"))
    }
}

/// IPA characters of espeak-ng output, lines joined by a word space.
fn ipa_chars(ipa: &str) -> Vec<char> {
    let mut chars = Vec::new();
    for line in ipa.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !chars.is_empty() {
            chars.push(' ');
        }
        chars.extend(line.chars().filter(|&ch| ch != '_'));
    }
    chars
}
