use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One logical unit of input data. `None` marks an absent session or
/// acquisition and is kept distinct from an empty label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTuple {
    pub subject: String,
    pub session: Option<String>,
    pub acquisition: Option<String>,
}

impl EntityTuple {
    pub fn new(subject: &str, session: Option<&str>, acquisition: Option<&str>) -> Self {
        Self {
            subject: subject.to_string(),
            session: session.map(str::to_string),
            acquisition: acquisition.map(str::to_string),
        }
    }

    /// Name of the directory the workflow engine creates for this
    /// iteration, e.g. `_acquisition_haste_session_01_subject_003`.
    pub fn engine_folder(&self) -> String {
        format!(
            "_acquisition_{}_session_{}_subject_{}",
            self.acquisition.as_deref().unwrap_or("None"),
            self.session.as_deref().unwrap_or("None"),
            self.subject
        )
    }

    /// `sub-<s>/ses-<e>/<datatype>`, without the session level when the
    /// session is absent.
    pub fn bids_dir(&self, datatype: &str) -> String {
        match &self.session {
            Some(ses) => format!("sub-{}/ses-{}/{}", self.subject, ses, datatype),
            None => format!("sub-{}/{}", self.subject, datatype),
        }
    }
}

/// Read-only view of the subjects, sessions and acquisitions known to a
/// metadata index.
pub trait EntityCatalogue {
    fn subjects(&self) -> Vec<String>;
    fn sessions(&self, subject: &str) -> Vec<String>;
    fn acquisitions(&self, subject: &str, session: Option<&str>) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalogue {
    subjects: Vec<String>,
    sessions: BTreeMap<String, Vec<String>>,
    acquisitions: BTreeMap<(String, Option<String>), Vec<String>>,
}

impl InMemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: &str, sessions: &[&str]) -> Self {
        if !self.subjects.iter().any(|s| s == subject) {
            self.subjects.push(subject.to_string());
        }
        self.sessions.insert(
            subject.to_string(),
            sessions.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_acquisitions(
        mut self,
        subject: &str,
        session: Option<&str>,
        acquisitions: &[&str],
    ) -> Self {
        self.acquisitions.insert(
            (subject.to_string(), session.map(str::to_string)),
            acquisitions.iter().map(|a| a.to_string()).collect(),
        );
        self
    }
}

impl EntityCatalogue for InMemoryCatalogue {
    fn subjects(&self) -> Vec<String> {
        self.subjects.clone()
    }

    fn sessions(&self, subject: &str) -> Vec<String> {
        self.sessions.get(subject).cloned().unwrap_or_default()
    }

    fn acquisitions(&self, subject: &str, session: Option<&str>) -> Vec<String> {
        self.acquisitions
            .get(&(subject.to_string(), session.map(str::to_string)))
            .cloned()
            .unwrap_or_default()
    }
}

fn or_none(values: Vec<String>) -> Vec<Option<String>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.into_iter().map(Some).collect()
    }
}

/// Cross-product of subjects, sessions and acquisitions to run over.
///
/// Absent lists are filled from the catalogue. Session and acquisition
/// defaults are queried again for every subject (and every session), so
/// one subject's sessions never carry over to the next. Unknown entities
/// are warned about and still emitted.
pub fn enumerate<C: EntityCatalogue + ?Sized>(
    catalogue: &C,
    subjects: Option<&[String]>,
    sessions: Option<&[String]>,
    acquisitions: Option<&[String]>,
) -> Vec<EntityTuple> {
    let existing_sub = catalogue.subjects();
    let subjects = match subjects {
        Some(list) => list.to_vec(),
        None => existing_sub.clone(),
    };

    let mut tuples = Vec::new();
    for sub in &subjects {
        if !existing_sub.contains(sub) {
            warn!(subject = %sub, "subject was not found");
        }

        let existing_ses = catalogue.sessions(sub);
        let subject_sessions = match sessions {
            Some(list) => or_none(list.to_vec()),
            None => or_none(existing_ses.clone()),
        };

        for ses in &subject_sessions {
            if let Some(ses) = ses {
                if !existing_ses.contains(ses) {
                    warn!(subject = %sub, session = %ses, "session was not found for subject");
                }
            }

            let existing_acq = catalogue.acquisitions(sub, ses.as_deref());
            let session_acquisitions = match acquisitions {
                Some(list) => or_none(list.to_vec()),
                None => or_none(existing_acq.clone()),
            };

            for acq in &session_acquisitions {
                if let Some(acq) = acq {
                    if !existing_acq.contains(acq) {
                        warn!(
                            subject = %sub,
                            session = ses.as_deref().unwrap_or("None"),
                            acquisition = %acq,
                            "acquisition was not found"
                        );
                    }
                }
                tuples.push(EntityTuple {
                    subject: sub.clone(),
                    session: ses.clone(),
                    acquisition: acq.clone(),
                });
            }
        }
    }
    tuples
}
