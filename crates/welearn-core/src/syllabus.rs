//! Syllabus template, GreenComp framework text, and structural checks on
//! generated syllabi.
//!
//! A valid syllabus has exactly these sections, in order:
//!
//! | # | Section             | Constraint                                            |
//! |---|---------------------|-------------------------------------------------------|
//! | 1 | Course Description  |                                                       |
//! | 2 | Learning Objectives |                                                       |
//! | 3 | Learning Outcomes   |                                                       |
//! | 4 | Competencies        |                                                       |
//! | 5 | Assessment Methods  |                                                       |
//! | 6 | Course Schedule     | markdown table `week \| Topics \| Learning Outcomes \| Class Plan` |
//! | 7 | References          | never loses a reference across revisions              |
//!
//! The checks are advisory: the tutor pipeline logs violations rather than
//! rejecting LLM output.

use thiserror::Error;

/// Section titles of a syllabus, in the required order.
pub const SECTIONS: [&str; 7] = [
    "Course Description",
    "Learning Objectives",
    "Learning Outcomes",
    "Competencies",
    "Assessment Methods",
    "Course Schedule",
    "References",
];

/// Header cells of the Course Schedule table.
pub const SCHEDULE_COLUMNS: [&str; 4] = ["week", "Topics", "Learning Outcomes", "Class Plan"];

pub const SYLLABUS_TEMPLATE: &str = r#"# {Course Title}

## Course Description
A short paragraph introducing the course, its discipline, its level and its duration.

## Learning Objectives
1. Broad goal describing what students will gain from the course.
2. ...

## Learning Outcomes
1. Specific and measurable outcome, formulated with an action verb.
2. ...

## Competencies
- Transferable skill or GreenComp competency developed in the course.
- ...

## Assessment Methods
- Evaluation method, with the learning outcomes it assesses and its weight.
- ...

## Course Schedule
| week | Topics | Learning Outcomes | Class Plan |
|------|--------|-------------------|------------|
| 1 | Topic of the week | Learning outcome numbers targeted this week | Activities run in class to reach those outcomes |
| 2 | ... | ... | ... |

## References
- <a href="document.url">document.title</a>
"#;

pub const GREENCOMP_FRAMEWORK: &str = "Here are the GreenComp competencies: \
url: https://joint-research-centre.ec.europa.eu/greencomp-european-sustainability-competence-framework_en \
1.1 Valuing sustainability: To reflect on personal values; identify and explain how values vary among people and over time, while critically evaluating how they align with sustainability values. \
1.2 Supporting fairness: To support equity and justice for current and future generations and learn from previous generations for sustainability. \
1.3 Promoting nature: To acknowledge that humans are part of nature; and to respect the needs and rights of other species and of nature itself in order to restore and regenerate healthy and resilient ecosystems. \
2.1 Systems thinking: To approach a sustainability problem from all sides; to consider time, space and context in order to understand how elements interact within and between systems. \
2.2 Critical thinking: To assess information and arguments, identify assumptions, challenge the status quo, and reflect on how personal, social and cultural backgrounds influence thinking and conclusions. \
2.3 Problem framing: To formulate current or potential challenges as a sustainability problem in terms of difficulty, people involved, time and geographical scope, in order to identify suitable approaches to anticipating and preventing problems, and to mitigating and adapting to already existing problems. \
3.1 Futures literacy: To envision alternative sustainable futures by imagining and developing alternative scenarios and identifying the steps needed to achieve a preferred sustainable future. \
3.2 Adaptability: To manage transitions and challenges in complex sustainability situations and make decisions related to the future in the face of uncertainty, ambiguity and risk. \
3.3 Exploratory thinking: To adopt a relational way of thinking by exploring and linking different disciplines, using creativity and experimentation with novel ideas or methods. \
4.1 Political agency: To navigate the political system, identify political responsibility and accountability for unsustainable behaviour, and demand effective policies for sustainability. \
4.2 Collective action: To act for change in collaboration with others. \
4.3 Individual initiative: To identify own potential for sustainability and to actively contribute to improving prospects for the community and the planet.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyllabusError {
    #[error("expected sections {expected:?}, found {found:?}")]
    Sections {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("course schedule table is missing or has header {found:?}")]
    ScheduleTable { found: Option<Vec<String>> },
    #[error("references removed: {missing:?}")]
    ReferencesRemoved { missing: Vec<String> },
}

/// Level-1 and level-2 markdown headings, in document order.
///
/// The course title heading (`# Title`) is included when present; callers
/// comparing against [`SECTIONS`] should use [`validate_structure`].
pub fn section_titles(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter_map(heading_title)
        .map(str::to_string)
        .collect()
}

/// Level-2 headings only: the sections, without the course title.
fn section_headings(markdown: &str) -> Vec<String> {
    markdown
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("## "))
        .map(|rest| rest.trim().trim_matches('*').trim().to_string())
        .collect()
}

/// Title of a level-1 or level-2 heading. Deeper headings are content.
fn heading_title(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = line
        .strip_prefix("## ")
        .or_else(|| line.strip_prefix("# "))?;
    Some(rest.trim().trim_matches('*').trim())
}

/// Lines belonging to the section named `name` (exclusive of the heading).
///
/// `###` subheadings stay inside the section, as lines of its body.
fn section_body<'a>(markdown: &'a str, name: &str) -> Vec<&'a str> {
    let mut body = Vec::new();
    let mut inside = false;
    for line in markdown.lines() {
        if let Some(title) = heading_title(line) {
            inside = title.eq_ignore_ascii_case(name);
            continue;
        }
        if inside {
            body.push(line);
        }
    }
    body
}

fn table_cells(row: &str) -> Vec<String> {
    row.trim()
        .trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

/// Check the seven sections and the Course Schedule table header.
///
/// Every `##` heading counts, so an unlisted section is a violation.
pub fn validate_structure(markdown: &str) -> Result<(), SyllabusError> {
    let found = section_headings(markdown);
    let ordered = found.len() == SECTIONS.len()
        && found
            .iter()
            .zip(SECTIONS.iter())
            .all(|(f, s)| f.eq_ignore_ascii_case(s));
    if !ordered {
        return Err(SyllabusError::Sections {
            expected: SECTIONS.iter().map(|s| s.to_string()).collect(),
            found,
        });
    }

    let header = section_body(markdown, "Course Schedule")
        .into_iter()
        .find(|l| l.trim_start().starts_with('|'))
        .map(table_cells);
    let header_ok = header.as_ref().is_some_and(|cells| {
        cells.len() == SCHEDULE_COLUMNS.len()
            && cells
                .iter()
                .zip(SCHEDULE_COLUMNS.iter())
                .all(|(c, e)| c.eq_ignore_ascii_case(e))
    });
    if !header_ok {
        return Err(SyllabusError::ScheduleTable { found: header });
    }
    Ok(())
}

/// Non-empty lines of the References section, trimmed.
pub fn references(markdown: &str) -> Vec<String> {
    section_body(markdown, "References")
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Every reference of `before` must still be listed in `after`.
pub fn preserves_references(before: &str, after: &str) -> Result<(), SyllabusError> {
    let kept = references(after);
    let missing: Vec<String> = references(before)
        .into_iter()
        .filter(|r| !kept.contains(r))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SyllabusError::ReferencesRemoved { missing })
    }
}
