//! Multi-pass transcript refinement: topic detection, cleanup, and
//! structured note generation over a text-generation service.

use log::debug;

use crate::openai::{ApiError, ChatModel};

/// Sample length for topic detection
pub const TOPIC_SAMPLE_CHARS: usize = 3000;
/// Piece size for the cleanup pass, bounded by model input limits
pub const CLEAN_CHUNK_CHARS: usize = 6000;
/// Piece size for note generation
pub const NOTES_CHUNK_CHARS: usize = 6000;
/// Sample length for structure analysis
pub const STRUCTURE_SAMPLE_CHARS: usize = 5000;
/// Sample length of combined notes fed to the summary pass
pub const SUMMARY_SAMPLE_CHARS: usize = 8000;

const TOPIC_PROMPT: &str = "Analyze this transcript and identify:
1. Subject area (e.g., physics, chemistry, history)
2. Specific topics covered (3-5 main topics)
3. Key technical terms that might be mistranscribed
4. Context type (university lecture, interview, etc.)

Respond in this format:
SUBJECT: [subject]
TOPICS: [comma-separated]
KEY_TERMS: [comma-separated]
CONTEXT: [context type]";

const STRUCTURE_PROMPT: &str = "Analyze this lecture transcript and identify:
1. Overall subject and suggested lecture title
2. Main topics/sections in order
3. Key terminology introduced

Respond in this format:
TITLE: [suggested title]
SUBJECT: [subject]
TOPICS:
1. [topic 1]
2. [topic 2]
...
KEY_TERMS: [comma-separated]";

/// Split text into pieces of at most `max_chars` characters, respecting
/// UTF-8 boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (i, _) in text.char_indices() {
        if count == max_chars {
            pieces.push(text[start..i].to_string());
            start = i;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(text[start..].to_string());
    }
    pieces
}

/// First `max_chars` characters of the text, UTF-8 safe
pub fn sample_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

/// Extract the TITLE line from a structure analysis reply
pub fn extract_title(structure: &str) -> String {
    structure
        .lines()
        .find_map(|line| line.strip_prefix("TITLE:"))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Lecture Notes".to_string())
}

/// Identify subject area, topics, likely-mistranscribed terms and context
/// from a bounded sample of the raw transcript. The result conditions the
/// cleanup pass.
pub fn detect_topic(chat: &dyn ChatModel, transcript: &str) -> Result<String, ApiError> {
    let sample = sample_prefix(transcript, TOPIC_SAMPLE_CHARS);
    chat.complete(TOPIC_PROMPT, &format!("Analyze:\n\n{}", sample), 0.2)
}

/// Fix transcription errors, remove gibberish and improve punctuation while
/// preserving meaning, piece by piece.
pub fn clean_transcript(
    chat: &dyn ChatModel,
    transcript: &str,
    topic_analysis: &str,
) -> Result<String, ApiError> {
    let system = format!(
        "You are cleaning up an audio transcript. Context:

{}

Tasks:
1. Fix transcription errors, especially technical terms
2. Remove gibberish/garbled text
3. Improve punctuation and sentence structure
4. Keep conversational style
5. Preserve original meaning

Output ONLY the cleaned transcript.",
        topic_analysis
    );

    let pieces = chunk_text(transcript, CLEAN_CHUNK_CHARS);
    debug!("cleaning transcript in {} pieces", pieces.len());

    let mut cleaned = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        cleaned.push(chat.complete(&system, &format!("Clean:\n\n{}", piece), 0.3)?);
    }
    Ok(cleaned.join("\n\n"))
}

/// Generate structured notes: analyze the transcript structure, convert each
/// piece into the fixed section template, then append a summary section.
/// Returns a document starting with a title heading.
pub fn generate_notes(
    chat: &dyn ChatModel,
    transcript: &str,
    _topic_analysis: &str,
) -> Result<String, ApiError> {
    let structure = chat.complete(
        STRUCTURE_PROMPT,
        &format!(
            "Analyze:\n\n{}",
            sample_prefix(transcript, STRUCTURE_SAMPLE_CHARS)
        ),
        0.2,
    )?;
    let title = extract_title(&structure);

    let notes_prompt = format!(
        "Create structured class notes from this lecture transcript.

Structure detected:
{}

Use this EXACT format for each section:

## [Topic Name]

### Key Concepts
- **Concept**: Clear explanation

### Definitions
- **Term**: Definition

### Formulas/Equations (if any)
- Equation with explanation

### Examples
- Examples from the lecture

### Student Q&A (if present)
- **Q**: Question
- **A**: Answer

Extract ALL important information. Use LaTeX for math. Output ONLY formatted notes.",
        structure
    );

    let pieces = chunk_text(transcript, NOTES_CHUNK_CHARS);
    debug!("generating notes over {} pieces", pieces.len());

    let mut note_pieces = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        note_pieces.push(chat.complete(
            &notes_prompt,
            &format!("Convert to notes:\n\n{}", piece),
            0.3,
        )?);
    }
    let combined = note_pieces.join("\n\n");

    let summary_prompt = format!(
        "Based on these lecture notes, create a summary:

{}

Create a \"## Summary\" section with:
- 5-7 bullet points of main takeaways
- Key formulas to remember
- Important concepts

Output ONLY the summary section.",
        sample_prefix(&combined, SUMMARY_SAMPLE_CHARS)
    );
    let summary = chat.complete(&summary_prompt, "Create summary.", 0.3)?;

    Ok(format!("# {}\n\n{}\n\n{}", title, combined, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_text_splits_on_char_count() {
        let text = "a".repeat(14);
        let pieces = chunk_text(&text, 6);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 6);
        assert_eq!(pieces[2].len(), 2);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn chunk_text_respects_utf8_boundaries() {
        let text = "héllo wörld ünïcode tèxt";
        let pieces = chunk_text(text, 5);
        assert_eq!(pieces.concat(), text);
        for piece in pieces {
            assert!(piece.chars().count() <= 5);
        }
    }

    #[test]
    fn chunk_text_empty_is_empty() {
        assert!(chunk_text("", 10).is_empty());
    }

    #[test]
    fn sample_prefix_is_char_bounded() {
        assert_eq!(sample_prefix("äbcdef", 3), "äbc");
        assert_eq!(sample_prefix("ab", 10), "ab");
    }

    #[test]
    fn title_extraction_with_default() {
        let structure = "TITLE: Thermodynamics I\nSUBJECT: physics";
        assert_eq!(extract_title(structure), "Thermodynamics I");
        assert_eq!(extract_title("SUBJECT: physics"), "Lecture Notes");
        assert_eq!(extract_title("TITLE:   "), "Lecture Notes");
    }
}
