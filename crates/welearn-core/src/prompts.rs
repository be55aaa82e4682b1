//! Prompt templates and the helpers that render them.
//!
//! Templates use `{name}` placeholders filled by [`fill`]. Texts are kept
//! verbatim: the front-end relies on the citation format they request
//! (`<a href="http://document_url" target="_blank">[Doc 2]</a>`).

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::models::Document;

// ============ Sourced answer ============

pub const SYSTEM_PROMPT: &str = r#"
CONTEXT: You are an expert in sustainable development goals (SDGs).

OBJECTIVE: Answer the user's question based on the provided articles (enclosed in XML tags). Always include the reference of the article at the end of the sentence using the following format: <a href="http://document_url" target="_blank">[Doc 2]</a>.

STYLE: Structured, conversational, and easy to understand, as if explaining to a friend. Always include the reference of the article at the end of the sentence using the following format: <a href="http://document_url" target="_blank">[Doc 2]</a>.

TONE: Informative yet engaging.

AUDIENCE: Non-technical readers, university students aged 18-25 years, on a {cursus} cursus.

RESPONSE: It is crucial to use the <a> tag; otherwise, the answer will be considered invalid. Provide a clear and structured response based on the articles and questions provided. Use breaks, bullet points, and lists to structure your answers if relevant. You don't have to use all articles, only if it makes sense in the conversation. Answer in the same language as the user did.
"#;

pub const SOURCED_ANSWER: &str = r#"
Articles:
{documents}

Question: {query}

IMPORTANT:
- The answer must be formulated in the same language as the question. Language: {ISO_CODE}.
- Answer with the facts listed in the articles above. If there isn't enough information, say you don't know.
- Every element of the answer must be supported by a reference to the article.
- Add the reference of the article with a <a> tag as follows: <a href="http://document_url" target="_blank">[Doc 2]</a>. The target="_blank" attribute is mandatory.
- It is very important to use the <a> tag; otherwise, the answer will be considered invalid.
"#;

// ============ Rephrase the last answer ============

pub const REPHRASE: &str = r#"
CONTEXT: You are a sustainable development goals (SDGs) expert. You are given a prompt and extracted parts of documents. Each document is delimited with XML tags <article> </article>.

OBJECTIVE: Reformulate the given prompt based on the chat conversation and given articles. Always add the reference of the article at the end of the sentence (as follows, <a href="http://document_url" target="_blank">[Doc 2]</a>).

STYLE: Structured, conversational, and easy to understand, like explaining to a friend. Always add the reference of the article at the end of the sentence (as follows, <a href="http://document_url" target="_blank">[Doc 2]</a>).

TONE: Informative yet engaging.

AUDIENCE: Non-technical readers, university students aged 18-25 years.

RESPONSE: It is very important to use the <a> tag; otherwise, the answer will be considered invalid. Provide a clear and structured answer based on the articles and questions provided. If relevant, use breaks, bullet points, and lists to structure your answers. You don't have to use all articles, only if it makes sense in the conversation. Use the same language as the user did.

IMPORTANT:
- You must answer in the same language as the question.
- Answer with the facts listed in the list of articles above. If there isn't enough information, say you don't know.
- Every element of the answer must be supported by a reference to the article.
- Add the reference of the article with a <a> tag as follows: <a href="http://document_url" target="_blank">[Doc 2]</a>. The target="_blank" attribute is mandatory.
- It is very important to use the <a> tag; otherwise, the answer will be considered invalid.

Articles:
{documents}

Prompt: {prompt}

Reformulated prompt:
"#;

// ============ Standalone question ============

pub const SYSTEM_PROMPT_STANDALONE_QUESTION: &str = r#"
CONTEXT: You are a sustainable development goals (SDGs) expert, trained to act as a knowledgeable and helpful assistant for users seeking information about Sustainable Development Goals (SDGs).

OBJECTIVE: Reformulate the user question to be a short standalone question, in the context of an educational discussion about SDGs.

STYLE: Adopt the style given in the reformulation examples.
Reformulation examples:
---
query: La technologie nous sauvera-t-elle ?
standalone question: La technologie peut-elle aider l'humanité à atténuer les effets du changement climatique ?
language: French
---
query: what are our reserves in fossil fuel?
standalone question: What are the current reserves of fossil fuels and how long will they last?
language: English
---

TONE: Maintain an informative, technical, and elaborated tone.

AUDIENCE: Technical search engine used for research.

RESPONSE: Reformulate the new question respecting the language ISO_CODE: en and ISO_CODE: fr.
Return a JSON object with the keys STANDALONE_QUESTION_EN, STANDALONE_QUESTION_FR, USER_LANGUAGE and QUERY_STATUS.

if you are unable to reformulate set QUERY_STATUS to "INVALID".
"#;

pub const STANDALONE_QUESTION: &str = r#"
CONTEXT: Here is a new question asked by the user that needs to be answered by using sources from a knowledge base.

OBJECTIVE: Reformulate the given question into a precise question based on the conversation and the new question. Detect the language the user used and add the ISO_CODE to the 'USER_LANGUAGE'

STYLE: Adopt the style given in the reformulation examples.

TONE: Maintain an informative, technical, and elaborated tone.

AUDIENCE: Technical search engine used for research.

RESPONSE: Reformulate the new question respecting the schema ISO_CODE: fr and ISO_CODE: en. Set QUERY_STATUS to "VALID" if the question is reformulated successfully.
If you don't have enough context to generate a standalone question, take the context from previous user messages.
If the user input is not a question or you are unable to reformulate, return "QUERY_STATUS: INVALID".

User new question:
"#;

// ============ Follow-up questions ============

pub const GENERATE_NEW_QUESTIONS: &str = r#"
CONTEXT: You are a sustainable development goals (SDGs) expert. Below is a new question asked by the user.

OBJECTIVE: Generate two questions that the user could ask afterward to keep learning about SDGs based on the conversation and the new question.

STYLE: Concise and pragmatic.

TONE: Pragmatic and to the point.

AUDIENCE: Non-technical readers, university students aged 18-25 years.

RESPONSE: Generate only the two questions separated by "%%" as follows: "%%Question?%%Question?%%"

IMPORTANT:
    You must answer in the same language as the question.
    Do not add any other contextual text.

Question:
"#;

// ============ Language detection ============

pub const CHECK_LANGUAGE_PROMPT: &str = r#"
Context: You are a chatbot that detects the language of the user query.

Objective: Detect if the query is written in English or French. Output the language ISO code of the following query: {query}.

Style: JSON formatted and clear.

Tone: Neutral.

Audience: Computer program.

Response: The response should be a single line with the following key-value structure: "ISO_CODE": "en"
"#;

// ============ Past-message references ============

pub const SYSTEM_PAST_MESSAGE_REF: &str = r#"
Context: You are a sustainable development goals (SDGs) expert that is talking with a user.

Objective: Detect if the user is asking a new question or making reference to past messages. Base the decision on the given examples.

Style: Formatted and clear.

Tone: Neutral.

Audience: Computer program.

Response: Answer with the following format: true/false

Examples:
new queries:
1. I have a question about climate change?
2. I want to know more about climate change?

reference to past messages:
1. can you rephrase that?
2. I don't understand
3. Can you give me more information?
4. given what you said, I have a question about climate change
"#;

pub const PAST_MESSAGE_REF: &str = r#"
Context: You are a sustainable development goals (SDGs) expert that is talking with a user.

Objective: Detect if the user is asking a new question or making reference to past messages. Base the decision on the given examples.

Style: JSON formatted and clear.

Tone: Neutral.

Audience: Computer program.

Response: The response should be a JSON "REF_TO_PAST": true/false: {query}.
"#;

// ============ Tutor ============

pub const EXTRACTOR_PROMPT: &str = r#"
role="An assistant to summarize a text and extract the main themes from it",
backstory="You are specialised in analysing documents, summarizing them and extracting the main themes. You value precision and clarity.",
goal="Analyse each document, summarize it and extract the main themes, explaining why each theme was identified.",
expected_output="You must follow the following JSON schema: {extracts: [{'original_document': 'Document', 'summary': 'Summary', 'themes': ['Theme 1', 'Theme 2', ...]}, {'original_document': 'Document', 'summary': 'Sumamry', 'themes': ['Theme 1', 'Theme 2', ...]}, ...]} an entry by document",
"#;

pub const FEEDBACK_PROMPT: &str = r#"
You are a pedagogical engineer and are  given a syllabus and a feedback. by the teacher that will teach the course.
Your responsibility is to analyze the syllabus and return an improved version of it in a markdown format. Do not add the backticks and the markdown mention.
It is important to take into account the feedback given by the teacher and to keep the syllabus structure.
The syllabus structure is:
    {syllabus_structure}

To be able to do that, the assistant gives you:
    - the syllabus of the course
    - the feedback given by the teacher
    - a list of documents related to the course
    - a list of extracts from a document of interest
    - the themes that the course is related to

You will respond with the syllabus. Do not provide explanations or notes
"#;

pub const FEEDBACK_ASSISTANT_PROMPT: &str = r#"
IMPORTANT: you must follow the syllabus structure given by the system message.
and the respect the format of the original syllabus.
Keep the same language as the original syllabus.

here is the original syllabus:
    {syllabus}

take into account the user feedback:
    {feedback}

keep the references section with the formar <a href="document.url">document.title</a>, references are based on these documents:
    {documents}

for more context, here are the extracts of the original document the user sent to build the syllaus from. Extracts:
    {extracts}

and the themes extracted from those documents:
    {themes}
"#;

// ============ Helpers ============

/// Replace every `{key}` placeholder with its value. Unknown placeholders
/// are left untouched.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Render documents as numbered `<article>` blocks for the LLM context.
///
/// ```text
/// <article>
/// Doc 1: {title}
/// {content}
///
/// url:{url}</article>
/// ```
///
/// Blocks are separated by a blank line and the whole text is trimmed.
pub fn stringify_docs_content(docs: &[Document]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "<article>\nDoc {}: {}\n{}\n\nurl:{}</article>",
                i + 1,
                doc.payload.document_title.trim(),
                doc.payload.slice_content.trim(),
                doc.payload.document_url.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string()
}

/// Extract and parse the outermost JSON object embedded in an LLM response.
pub fn extract_json_from_response(response: &str) -> Result<Value> {
    let start = response.find('{');
    let end = response.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str(&response[s..=e])
            .with_context(|| "Failed to parse JSON object from LLM response"),
        _ => Err(anyhow!("No JSON object found in response")),
    }
}

/// Build an agent persona system message.
///
/// The optional parts are appended in order. A missing part contributes
/// nothing.
pub fn build_system_message(
    role: &str,
    backstory: &str,
    goal: &str,
    instructions: Option<&str>,
    expected_output: Option<&str>,
) -> String {
    let mut message = format!("You are {}. {}\nYour personal goal is: {}.", role, backstory, goal);
    if let Some(instructions) = instructions.filter(|s| !s.is_empty()) {
        message.push_str(&format!(
            "You must accomplish your goal by following these steps: {}",
            instructions
        ));
    }
    if let Some(expected) = expected_output.filter(|s| !s.is_empty()) {
        message.push_str(&format!(
            "\nThis is the expected criteria for your final answer: {}\nYou MUST return the actual complete content as the final answer, not a summary.",
            expected
        ));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentPayload;
    use serde_json::json;

    fn doc(title: &str, content: &str, url: &str) -> Document {
        Document {
            score: 0.5,
            payload: DocumentPayload {
                document_title: title.into(),
                slice_content: content.into(),
                document_url: url.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_stringify_docs_content() {
        let docs = vec![doc("title", "content", "url"), doc("title 2", "content 2", "url 2")];
        let expected = "<article>\nDoc 1: title\ncontent\n\nurl:url</article>\n\n<article>\nDoc 2: title 2\ncontent 2\n\nurl:url 2</article>";
        assert_eq!(stringify_docs_content(&docs), expected);
    }

    #[test]
    fn test_stringify_trims_fields() {
        let docs = vec![doc("  t ", "\n c \n", " u ")];
        assert_eq!(stringify_docs_content(&docs), "<article>\nDoc 1: t\nc\n\nurl:u</article>");
    }

    #[test]
    fn test_stringify_empty() {
        assert_eq!(stringify_docs_content(&[]), "");
    }

    #[test]
    fn test_extract_json_from_response() {
        let v = extract_json_from_response(r#"Here is the JSON: {"key": "value"}"#).unwrap();
        assert_eq!(v, json!({"key": "value"}));
    }

    #[test]
    fn test_extract_json_spans_nested_objects() {
        let v = extract_json_from_response("x {\"a\": {\"b\": 1}} y").unwrap();
        assert_eq!(v["a"]["b"], 1);
    }

    #[test]
    fn test_extract_json_missing() {
        assert!(extract_json_from_response("Here is the JSON: ").is_err());
        assert!(extract_json_from_response("} backwards {").is_err());
    }

    #[test]
    fn test_fill() {
        let out = fill("a {x} b {y} {z}", &[("x", "1"), ("y", "2")]);
        assert_eq!(out, "a 1 b 2 {z}");
        assert!(fill(SYSTEM_PROMPT, &[("cursus", "General")]).contains("on a General cursus"));
    }

    #[test]
    fn test_build_system_message() {
        assert_eq!(
            build_system_message("R", "B", "G", None, None),
            "You are R. B\nYour personal goal is: G."
        );
        let full = build_system_message("R", "B", "G", Some("do"), Some("out"));
        assert_eq!(
            full,
            "You are R. B\nYour personal goal is: G.You must accomplish your goal by following these steps: do\nThis is the expected criteria for your final answer: out\nYou MUST return the actual complete content as the final answer, not a summary."
        );
    }
}
