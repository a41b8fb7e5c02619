//! Prompt construction for every model call the crate makes.
//!
//! | Prompt                 | Used by                      | Priority       |
//! |------------------------|------------------------------|----------------|
//! | ambiguity detection    | `LlmAmbiguityDetector`       | analysis       |
//! | interpretation         | `LlmAmbiguityDetector`       | intervention   |
//! | contradiction scoring  | `LlmConsistencyChecker`      | analysis       |
//! | EARS requirements      | `RequirementGenerator`       | requirement    |
//! | assistant chat         | `SurveySession::chat`        | chat           |

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::analyzers::parse::ParseError;
use crate::context::{QuestionContext, SurveyContext};

/// Catalogue of ambiguity types with worked examples, embedded in the
/// detection and interpretation prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityTaxonomy {
    pub ambiguity_types: BTreeMap<String, AmbiguityType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityType {
    pub definition: String,
    #[serde(default)]
    pub subtypes: BTreeMap<String, AmbiguitySubtype>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguitySubtype {
    pub definition: String,
    #[serde(default)]
    pub example: Option<AmbiguityExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityExample {
    pub text: String,
    pub interpretations: Vec<String>,
}

impl AmbiguityTaxonomy {
    pub fn from_json_str(raw: &str) -> Result<Self, ParseError> {
        serde_json::from_str(raw).map_err(|e| ParseError::Json {
            reason: e.to_string(),
            snippet: raw.chars().take(120).collect(),
        })
    }

    fn subtype(definition: &str, text: &str, interpretations: &[&str]) -> AmbiguitySubtype {
        AmbiguitySubtype {
            definition: definition.to_string(),
            example: Some(AmbiguityExample {
                text: text.to_string(),
                interpretations: interpretations.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}

impl Default for AmbiguityTaxonomy {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        let mut add = |name: &str, definition: &str, subtypes: Vec<(&str, AmbiguitySubtype)>| {
            types.insert(
                name.to_string(),
                AmbiguityType {
                    definition: definition.to_string(),
                    subtypes: subtypes
                        .into_iter()
                        .map(|(sub, detail)| (sub.to_string(), detail))
                        .collect(),
                },
            );
        };

        add(
            "lexical",
            "A word or phrase has more than one meaning in the context of the response.",
            vec![(
                "polysemy",
                Self::subtype(
                    "A single word carries several related senses.",
                    "The system should show the latest reviews.",
                    &[
                        "reviews submitted most recently",
                        "reviews for the current academic year",
                        "reviews that were most recently edited",
                    ],
                ),
            )],
        );
        add(
            "syntactic",
            "The sentence structure allows more than one grouping of its parts.",
            vec![(
                "attachment",
                Self::subtype(
                    "A modifier can attach to more than one constituent.",
                    "Students can comment on modules with low ratings.",
                    &[
                        "students may comment only on modules that have low ratings",
                        "students may leave low-rated comments on modules",
                        "students with low ratings may comment on modules",
                    ],
                ),
            )],
        );
        add(
            "semantic",
            "The sentence has a single structure but more than one reading.",
            vec![(
                "scope",
                Self::subtype(
                    "The scope of a quantifier or negation is unclear.",
                    "Every lecturer should see a summary.",
                    &[
                        "each lecturer sees a summary of their own modules",
                        "all lecturers see the same department-wide summary",
                        "each lecturer sees a summary of every module",
                    ],
                ),
            )],
        );
        add(
            "vagueness",
            "A term lacks a clear boundary, so compliance cannot be tested.",
            vec![(
                "unquantified",
                Self::subtype(
                    "A quality or quantity is stated without a measurable threshold.",
                    "Feedback should load quickly.",
                    &[
                        "feedback loads within one second",
                        "feedback loads without a visible spinner",
                        "feedback loads faster than the current system",
                    ],
                ),
            )],
        );

        Self {
            ambiguity_types: types,
        }
    }
}

/// System prompt for the yes/no ambiguity classification.
pub fn ambiguity_detection_prompt(taxonomy: &AmbiguityTaxonomy, system_name: &str) -> String {
    let mut prompt = format!(
        "You are an expert requirement analyst analysing raw responses from a requirement \
         elicitation survey for ambiguity in a {system_name}.\n\n\
         For each response, you will be given:\n\
         1. The survey question being answered\n\
         2. The response text to analyze\n\n\
         Here is a comprehensive guide of ambiguity types with examples:\n"
    );

    for (name, detail) in &taxonomy.ambiguity_types {
        let _ = write!(prompt, "\n{} AMBIGUITY:\nDefinition: {}\n", name.to_uppercase(), detail.definition);
        for (subtype, sub) in &detail.subtypes {
            let _ = write!(prompt, "\nSubtype: {subtype}\nDefinition: {}\n", sub.definition);
            if let Some(example) = &sub.example {
                let _ = writeln!(prompt, "Example Text: \"{}\"", example.text);
                let _ = writeln!(prompt, "Possible Interpretations:");
                for interpretation in &example.interpretations {
                    let _ = writeln!(prompt, "- {interpretation}");
                }
            }
        }
    }

    prompt.push_str(
        "\nWhen one part of the text fulfills one ambiguity type:\n\
         1. First check the complete response text: does another part of the response clarify this element?\n\
         2. Then check the question context: does knowing what was asked resolve the remaining ambiguity?\n\
         3. Only mark as ambiguous if the meaning remains unclear after considering both.\n\n\
         Respond with ONLY 'yes' or 'no' to indicate if the response is ambiguous:\n\
         - \"yes\" if a part remains ambiguous even after considering the response and question context\n\
         - \"no\" if any apparent ambiguity is resolved by either\n",
    );
    prompt
}

/// System prompt asking for three interpretations of the most ambiguous phrase.
pub fn interpretation_prompt(taxonomy: &AmbiguityTaxonomy, system_name: &str) -> String {
    let mut prompt = format!(
        "You are an expert requirement analyst analysing raw responses from a requirement \
         elicitation survey for ambiguity in a {system_name}.\n\n\
         You will receive the survey question being answered and a response that needs \
         interpretation. Generate interpretations that address how the ambiguous response \
         could be understood in the context of the question.\n\n\
         Examples of how different types of ambiguity can be interpreted:\n"
    );

    for (name, detail) in &taxonomy.ambiguity_types {
        let _ = write!(prompt, "\n{} AMBIGUITY EXAMPLES:\nGeneral definition: {}\n", name.to_uppercase(), detail.definition);
        for (subtype, sub) in &detail.subtypes {
            if let Some(example) = &sub.example {
                let _ = write!(prompt, "\nSubtype: {subtype}\nWhen encountering: \"{}\"\nPossible interpretations:\n", example.text);
                for (idx, interpretation) in example.interpretations.iter().enumerate() {
                    let _ = writeln!(prompt, "{}. {interpretation}", idx + 1);
                }
            }
        }
    }

    prompt.push_str(
        "\nFollowing these examples, provide interpretations for the part you consider most ambiguous.\n\
         Rules:\n\
         1. Generate exactly 3 distinct interpretations\n\
         2. Make interpretations specific and relevant to what was being asked\n\
         3. Each interpretation must read as a direct replacement for the trigger phrase\n\n\
         Format your response as a JSON object with exactly this structure:\n\
         {\"interpretations\": [\"first\", \"second\", \"third\"], \"trigger_phrase\": \"specific ambiguous phrase\"}\n",
    );
    prompt
}

/// User message shared by detection and interpretation.
pub fn analysis_prompt(question: &QuestionContext, text: &str) -> String {
    format!(
        "Question being answered: {}\n\nResponse to analyze: {text}",
        question.text
    )
}

/// Frame a statement with the question it answers.
pub fn framed_statement(system_name: &str, question_text: &str, text: &str) -> String {
    format!(
        "In a requirement elicitation survey about the {system_name}, when asked \
         '{question_text}', the stakeholder responded: {text}"
    )
}

pub const CONSISTENCY_SYSTEM_PROMPT: &str = "You are a natural language inference judge. \
You receive one CURRENT statement and a list of PREVIOUS statements from the same stakeholder. \
For every previous statement, estimate the probability (0.0 to 1.0) that it contradicts the \
current statement. Statements about unrelated topics do not contradict.\n\
Respond with ONLY a JSON array: [{\"segment_id\": \"...\", \"contradiction_score\": 0.0}]";

/// User message listing the current statement and every prior one by id.
pub fn consistency_prompt(current: &str, previous: &[(String, String)]) -> String {
    let mut prompt = format!("CURRENT:\n{current}\n\nPREVIOUS:\n");
    for (segment_id, statement) in previous {
        let _ = writeln!(prompt, "[{segment_id}] {statement}");
    }
    prompt
}

pub const REQUIREMENT_SYSTEM_PROMPT: &str = "You are a requirements engineering expert. \
Generate clear, precise raw requirements from user needs using the EARS template:\n\
1. Base requirement: \"The system shall <action>.\"\n\
2. Event-driven: \"When <event>, the system shall <action>.\"\n\
3. State-driven: \"While <state>, the system shall <action>.\"\n\
4. Unwanted behavior: \"If <condition>, the system shall <action>.\"\n\
5. Optional: \"Where <feature>, the system shall <action>.\"\n\n\
Guidelines:\n\
- A requirement should use multiple segments where possible\n\
- Each segment should be used for at most ONE requirement\n\
- Focus on functional requirements and be specific and unambiguous\n\
- Resolve inconsistencies between segments where possible\n\
- Capture the intent behind segments rather than paraphrasing them\n\
- Link each requirement to its source segment(s)\n\n\
Return results in JSON format: [{\"requirement\": \"...\", \"segments\": [\"id1\", \"id2\"]}]\n\
The 'segments' field lists the ids of all segments that contributed to the requirement.";

/// User message for requirement generation.
pub fn requirement_prompt(question_text: &str, system_name: &str, segments: &[(String, String)]) -> String {
    let mut prompt = format!(
        "Question context: '{question_text}'\n\n\
         Generate raw requirements for a {system_name} based on the following user inputs:\n"
    );
    for (idx, (segment_id, text)) in segments.iter().enumerate() {
        let _ = write!(prompt, "\nSegment {} (ID: {segment_id}):\n{text}\n", idx + 1);
    }
    prompt
}

/// System prompt for the survey assistant chat.
pub fn chat_system_prompt(context: &SurveyContext) -> String {
    let system = &context.system_context;
    let mut prompt = format!(
        "You are a helpful assistant supporting a stakeholder who is answering a requirement \
         elicitation survey about the {} ({}).",
        system.name, system.kind
    );
    if !system.description.is_empty() {
        let _ = write!(prompt, " {}", system.description);
    }
    prompt.push_str(
        " Help the stakeholder express their needs clearly. Do not invent requirements on their behalf.",
    );
    prompt
}
