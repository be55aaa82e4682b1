//! Syllabus tutoring: theme extraction from uploads, a three-stage
//! syllabus pipeline and teacher feedback.
//!
//! ```text
//! UniversityTeacher ──draft──▶ SDGExpert ──revision──▶ PedagogicalEngineer
//!        │                         │                          │
//!        └─────────────────────────┴──────────────────────────┴──▶ results
//! ```
//!
//! Every stage output is returned, in order. Structure and reference checks
//! from [`welearn_core::syllabus`] are logged, never enforced.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use welearn_core::models::{
    Document, EnhancedSearchQuery, ExtractorOutputList, Message, SyllabusFeedback,
    SyllabusResponse, SyllabusResponseAgent, TutorSearchResponse, TutorSyllabusRequest,
};
use welearn_core::prompts::{
    build_system_message, extract_json_from_response, fill, EXTRACTOR_PROMPT,
    FEEDBACK_ASSISTANT_PROMPT, FEEDBACK_PROMPT,
};
use welearn_core::syllabus::{
    preserves_references, validate_structure, GREENCOMP_FRAMEWORK, SYLLABUS_TEMPLATE,
};

use crate::error::ApiError;
use crate::llm::{completion_value, CompletionOptions, LlmClient};
use crate::search::SearchService;

pub const UNIVERSITY_TEACHER: &str = "UniversityTeacherAgent";
pub const SDG_EXPERT: &str = "SDGExpertAgent";
pub const PEDAGOGICAL_ENGINEER: &str = "PedagogicalEngineerAgent";

// ============ Agent personas ============

const TEACHER_ROLE: &str = "the University Professor Agent, responsible for drafting the initial syllabus based on the course materials provided by the user. Your role is to structure the course content, ensuring it aligns with academic standards and effectively conveys the subject matter.";
const TEACHER_BACKSTORY: &str = "You are a highly experienced university professor with expertise in structuring academic courses. You understand the nuances of designing a syllabus that is comprehensive yet adaptable, providing a strong foundation for course delivery. Your experience spans multiple disciplines, and you excel at organizing complex information into a structured curriculum.";
const TEACHER_GOAL: &str = "Generate the first version of the syllabus, ensuring that it reflects the course content and discipline provided by the user. Your syllabus should be structured based on the syllabus template, and your version will serve as the foundation for subsequent agents.";
const TEACHER_INSTRUCTIONS: &str = "1. Analyze the input materials uploaded by the user: 'content', 'summary', and 'themes'.\
2. Based on the Draft the following sections:\
Course Description: Provide a brief yet clear introduction to the course.\
Learning Objectives: Outline broad goals that define what students will gain from the course.\
Learning Outcomes: Define specific and measurable outcomes students should achieve.\
Competencies: Define transferable skills that the students will gain after this course.\
Assessment Methods: Propose methods to evaluate student progress.\
Course Schedule: Create a week-by-week breakdown with key topics and associated learning outcomes.\
References: Include all sources that you use to construct the syllabus.";

const EXPERT_ROLE: &str = "the Sustainability Expert Agent, responsible for integrating sustainability concepts into the syllabus. Your role is to ensure that the syllabus aligns with relevant sustainability principles and frameworks in a way that is appropriate for the course discipline.";
const EXPERT_BACKSTORY: &str = "You are a recognized expert in sustainability education, well-versed in the Sustainable Development Goals (SDGs) and emerging sustainability research. Your expertise allows you to inject sustainability elements into any discipline, making them relevant and actionable for students.";
const EXPERT_GOAL: &str = "Modify the initial syllabus provided by the University Professor Agent to integrate sustainability content in a relevant and meaningful way.";
const EXPERT_INSTRUCTIONS: &str = "1. Analyze the syllabus generated by the University Professor Agent. Ensure modifications are discipline-appropriate and avoid forcing sustainability concepts where they do not naturally fit.\
2. Evaluate and refine the following sections:\
Course Description: Ensure sustainability relevance is reflected.\
Learning Objectives & Outcomes: Add sustainability-focused objectives where applicable.\
Competencies Developed: If relevant, integrate sustainability competencies.\
Course Schedule: Introduce sustainability-related themes into weekly topics where appropriate.\
References: NEVER delete, summarize, or modify any references already present in the syllabus. Only append this section with any additional sources that you use to construct the syllabus. ";

const ENGINEER_ROLE: &str = "the Pedagogical Engineer Agent, responsible for ensuring that the syllabus adheres to best practices in pedagogy. Your role is to refine learning objectives, align assessments with learning outcomes, and include competencies from the EU GreenComp Framework. You optimize the syllabus for student engagement and effectiveness.";
const ENGINEER_BACKSTORY: &str = "You are an experienced pedagogical engineer specializing in higher education course design. You are deeply familiar with competency-based learning and the EU GreenComp Framework, active learning strategies, and assessment alignment. Your expertise ensures that syllabi are not only well-structured but also effective for learning.";
const ENGINEER_GOAL: &str = "Refine the syllabus provided by the SDG Expert Agent to optimize its pedagogical effectiveness and coherence. Make sure the learning objectives, learning outcomes, and competencies are linked, and that the activities proposed in the Course Plan are appropriate for the accomplishment of the learning outcomes that are targeted.";
const ENGINEER_INSTRUCTIONS: &str = "1. Analyze the syllabus generated by the SDG Expert Agent.\
2. Evaluate and refine the following sections:\
Learning Objectives & Outcomes: Ensure they are well-formulated and that the learning outcomes and thematically linked to the learning objectives.\
Competencies Developed: Integrate competencies from the EU GreenComp Framework and validate the inclusion of relevant transferable skills.\
Assessment Methods: Align evaluation strategies with learning outcomes.\
Course Schedule: (1) For EACH WEEK, make sure that the Learning Outcomes mentioned are the same ones as the ones listed in the Learning Outcomes section, and include the Learning Outcome number in front of each one. (2) analyse the learning outcome and add a new column entitled Class Plan including a structured plan for the class with the activities that the professor should implement in order to best accomplish the outcomes targeted for that week. Ensure activities align with active learning strategies and innovative pedagogical approaches. (3) Go back to the Learning Outcomes section and include the class activities you listen in the Class Plan in the formulation of each Learning Outcome, for the class activities are the measures with which the professor will measure the accomplishment of each outcome. Do this for EVERY WEEK. DO NOT SUMMARIZE OR USE ELLIPSES AS PLACEHOLDERS FOR THE ACTUAL COURSE PLAN.\
References: NEVER delete, summarize, or modify any references already present in the syllabus. Only append this section with any additional sources that you use to construct the syllabus.\
3. Check for consistency, clarity, and overall syllabus coherence to ensure usability for instructors.";

fn template_output(prefix: &str) -> String {
    format!("{}You must follow this template :\n {}", prefix, SYLLABUS_TEMPLATE)
}

fn teacher_system() -> String {
    build_system_message(
        TEACHER_ROLE,
        TEACHER_BACKSTORY,
        TEACHER_GOAL,
        Some(TEACHER_INSTRUCTIONS),
        Some(&template_output("")),
    )
}

fn expert_system() -> String {
    build_system_message(
        EXPERT_ROLE,
        EXPERT_BACKSTORY,
        EXPERT_GOAL,
        Some(EXPERT_INSTRUCTIONS),
        Some(&template_output(
            "1. The revised syllabus, ready for the pedagogical engineer's review. ",
        )),
    )
}

fn engineer_system() -> String {
    build_system_message(
        ENGINEER_ROLE,
        ENGINEER_BACKSTORY,
        ENGINEER_GOAL,
        Some(ENGINEER_INSTRUCTIONS),
        Some(&template_output(
            "1. Final Syllabus: The polished syllabus, ready for user review. ",
        )),
    )
}

/// `{title, url, content}` of each document, as handed to the SDG expert.
pub fn resources(documents: &[Document]) -> Vec<Value> {
    documents
        .iter()
        .map(|d| {
            json!({
                "title": d.payload.document_title,
                "url": d.payload.document_url,
                "content": d.payload.slice_content,
            })
        })
        .collect()
}

fn check_stage(source: &str, previous: Option<&str>, content: &str) {
    if let Err(e) = validate_structure(content) {
        warn!(agent = source, violation = %e, "syllabus structure");
    }
    if let Some(before) = previous {
        if let Err(e) = preserves_references(before, content) {
            warn!(agent = source, violation = %e, "syllabus references");
        }
    }
}

pub struct TutorService {
    llm: Arc<dyn LlmClient>,
    search: Arc<SearchService>,
    nb_results: usize,
}

impl TutorService {
    pub fn new(llm: Arc<dyn LlmClient>, search: Arc<SearchService>, nb_results: usize) -> Self {
        Self {
            llm,
            search,
            nb_results,
        }
    }

    async fn extract_themes(&self, contents: &[String]) -> Result<ExtractorOutputList> {
        let documents = contents
            .iter()
            .enumerate()
            .map(|(i, c)| format!("Document {}: {}", i + 1, c))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = [Message::system(EXTRACTOR_PROMPT), Message::user(documents)];
        let value = completion_value(self.llm.as_ref(), &messages, CompletionOptions::json()).await?;
        let object = match value {
            Value::String(s) => extract_json_from_response(&s)?,
            other => other,
        };
        Ok(serde_json::from_value(object)?)
    }

    /// Summaries and themes of the uploaded texts, plus the corpus documents
    /// closest to each summary.
    pub async fn tutor_search(&self, contents: &[String]) -> TutorSearchResponse {
        let extracts = match self.extract_themes(contents).await {
            Ok(list) => list.extracts,
            Err(e) => {
                error!(error = %e, "theme extraction failed");
                return TutorSearchResponse::default();
            }
        };
        if extracts.is_empty() {
            return TutorSearchResponse::default();
        }

        let summaries: Vec<String> = extracts.iter().map(|e| e.summary.clone()).collect();
        let mut qp = EnhancedSearchQuery::new(summaries);
        qp.nb_results = self.nb_results;

        match self.search.search_multi_inputs(&qp).await {
            Ok(documents) => TutorSearchResponse {
                nb_results: documents.len(),
                extracts,
                documents,
            },
            Err(e) => {
                error!(error = %e, "tutor search failed");
                TutorSearchResponse {
                    extracts,
                    nb_results: 0,
                    documents: Vec::new(),
                }
            }
        }
    }

    async fn run_stage(&self, source: &str, system: Vec<Message>, prompt: String) -> Result<String> {
        let started = Instant::now();
        let mut messages = system;
        messages.push(Message::user(prompt));
        let content = self.llm.complete(&messages, CompletionOptions::default()).await?;
        debug!(
            agent_type = source,
            response_time_ms = started.elapsed().as_millis() as u64,
            "tutor stage"
        );
        Ok(content)
    }

    /// Draft, revise and refine a syllabus from the extracts and documents.
    pub async fn tutor_manager(
        &self,
        request: &TutorSyllabusRequest,
        lang: &str,
    ) -> Result<Vec<SyllabusResponseAgent>> {
        let contents = request
            .extracts
            .iter()
            .map(|e| e.summary.as_str())
            .collect::<Vec<_>>()
            .join("summary :");
        let themes = request
            .extracts
            .iter()
            .flat_map(|e| e.themes.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",");

        let mut course = vec![format!("LANGUAGE: {}", lang)];
        for (label, value) in [
            ("COURSE TITLE", &request.course_title),
            ("LEVEL", &request.level),
            ("DURATION", &request.duration),
            ("DESCRIPTION", &request.description),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                course.push(format!("{}: {}", label, v));
            }
        }

        let draft_prompt = format!(
            "Using the content in TEXT CONTENTS, you generate a syllabus that is engaging and coherent in relation to the THEMES extracted from these contents. \n\n{}\n\nTEXT CONTENTS:\n{}\n\nTHEMES:\n{}",
            course.join("\n"),
            contents,
            themes
        );
        let draft = self
            .run_stage(UNIVERSITY_TEACHER, vec![Message::system(teacher_system())], draft_prompt)
            .await?;
        check_stage(UNIVERSITY_TEACHER, None, &draft);

        let resources = serde_json::to_string(&resources(&request.documents))?;
        let revise_prompt = format!(
            "Use these WeLearn documents: {} to integrate sustainability in this syllabus: {}. You do not need to use ALL the information in the WeLearn documents, but ensure that sustainability integration is done in a way that is relevant and thematically linked to the discipline and the topics of the syllabus, that they are deeply embedded in the course content, and aligned with both the discipline and the broader educational goals. Add all WeLearn documents that you use in the REFERENCES section of the syllabus.",
            resources, draft
        );
        let revised = self
            .run_stage(
                SDG_EXPERT,
                vec![Message::system(expert_system()), Message::system(GREENCOMP_FRAMEWORK)],
                revise_prompt,
            )
            .await?;
        check_stage(SDG_EXPERT, Some(&draft), &revised);

        let refine_prompt = format!(
            "Ensure that the syllabus is pedagogically sound, aligns with competency-based learning, and optimizes student engagement and learning effectiveness. Ensure that the learning objectives, outcomes and the competencies and related in a logical and meaningful way, and that these overarching goals are accomplished through the course plan and activities, also ensure that the competencies cited in the EU GreenComp framework are present in the syllabus in a way that is coherent with the discipline and the course content.\n\nSYLLABUS:\n{}",
            revised
        );
        let refined = self
            .run_stage(
                PEDAGOGICAL_ENGINEER,
                vec![Message::system(engineer_system()), Message::system(GREENCOMP_FRAMEWORK)],
                refine_prompt,
            )
            .await?;
        check_stage(PEDAGOGICAL_ENGINEER, Some(&revised), &refined);

        info!(lang, documents = request.documents.len(), "syllabus generated");
        Ok(vec![
            SyllabusResponseAgent::new(draft, UNIVERSITY_TEACHER),
            SyllabusResponseAgent::new(revised, SDG_EXPERT),
            SyllabusResponseAgent::new(refined, PEDAGOGICAL_ENGINEER),
        ])
    }

    /// Revise the first syllabus with the teacher's feedback.
    pub async fn syllabus_feedback(&self, body: SyllabusFeedback) -> Result<SyllabusResponse> {
        let original = match body.syllabus.first() {
            Some(s) => s.content.clone(),
            None => return Err(ApiError::BadRequest("syllabus is empty".to_string()).into()),
        };
        let documents = serde_json::to_string(&resources(&body.documents))?;
        let extracts = body
            .extracts
            .iter()
            .map(|e| e.summary.as_str())
            .collect::<Vec<_>>()
            .join("/n");
        let themes = body
            .extracts
            .iter()
            .map(|e| e.themes.join(", "))
            .collect::<Vec<_>>()
            .join(", ");

        let messages = [
            Message::system(fill(
                FEEDBACK_PROMPT,
                &[("syllabus_structure", SYLLABUS_TEMPLATE)],
            )),
            Message::user(fill(
                FEEDBACK_ASSISTANT_PROMPT,
                &[
                    ("syllabus", &original),
                    ("feedback", &body.feedback),
                    ("documents", &documents),
                    ("extracts", &extracts),
                    ("themes", &themes),
                ],
            )),
        ];
        let syllabus = self.llm.complete(&messages, CompletionOptions::default()).await?;
        check_stage("feedback", Some(&original), &syllabus);

        Ok(SyllabusResponse {
            syllabus: vec![SyllabusResponseAgent::new(syllabus, "default")],
            documents: body.documents,
            extracts: body.extracts,
        })
    }
}
