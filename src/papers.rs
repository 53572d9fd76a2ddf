//! Paper validation and per-course title deduplication.

use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::Datelike;
use validator::Validate;

use crate::models::{CourseSummary, Id, NewPaper, PaperListing, PaperTitle};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PaperError {
    #[error("paper with course code {course} and year {year} already exists")]
    DuplicateExists { course: String, year: i32 },
    #[error("papers with course code {course} have title \"{established}\", not \"{proposed}\"")]
    TitleMismatch { course: String, established: String, proposed: String },
    #[error("year {0} is not valid")]
    InvalidYear(i32),
    #[error("pdf is not valid base64")]
    InvalidPdf,
    #[error("invalid paper: {0}")]
    Invalid(String),
}

/// What the store should do about the title of a new paper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleChoice {
    Reuse(Id),
    Create(String),
}

/// Papers already stored for one course, plus that course's shared title.
#[derive(Debug, Clone)]
pub struct CourseRecord {
    pub years: Vec<i32>,
    pub title: PaperTitle,
}

/// Field checks that don't need the store.
pub fn validate_new_paper(new: &NewPaper) -> Result<(), PaperError> {
    new.validate().map_err(|e| PaperError::Invalid(e.to_string()))?;
    let this_year = chrono::Utc::now().year();
    if new.year < 0 || new.year > this_year {
        return Err(PaperError::InvalidYear(new.year));
    }
    base64::engine::general_purpose::STANDARD
        .decode(new.pdf.trim())
        .map_err(|_| PaperError::InvalidPdf)?;
    Ok(())
}

/// Decide the title for `new` given what already exists for its course.
pub fn resolve_title(existing: Option<&CourseRecord>, new: &NewPaper) -> Result<TitleChoice, PaperError> {
    let Some(course) = existing else {
        return Ok(TitleChoice::Create(new.title.clone()));
    };
    if course.years.contains(&new.year) {
        return Err(PaperError::DuplicateExists { course: new.course.clone(), year: new.year });
    }
    if course.title.title != new.title {
        return Err(PaperError::TitleMismatch {
            course: new.course.clone(),
            established: course.title.title.clone(),
            proposed: new.title.clone(),
        });
    }
    Ok(TitleChoice::Reuse(course.title.id))
}

/// Group catalogue rows into `{course: {Name, paper_id, Years}}`.
pub fn summarize(listings: &[PaperListing]) -> BTreeMap<String, CourseSummary> {
    let mut out = BTreeMap::<String, CourseSummary>::new();
    for l in listings {
        out.entry(l.course.clone())
            .or_insert_with(|| CourseSummary { name: l.title.clone(), paper_id: l.paper_id, years: Vec::new() })
            .years
            .push(l.year);
    }
    out
}
