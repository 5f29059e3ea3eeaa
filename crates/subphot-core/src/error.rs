use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubphotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Unknown scope: no spacecraft configuration known for {0}")]
    UnknownScope(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid frame name: {0}")]
    InvalidFrameName(String),

    #[error("Duplicate {table} record for frame {origin}")]
    DuplicateRecord { table: &'static str, origin: String },

    #[error("No upstream {table} record for frame {origin}")]
    MissingUpstream { table: &'static str, origin: String },

    #[error("No current {kind} reference for project {project}, camera {camera}, ccd {ccd}")]
    NoReference {
        kind: String,
        project: u32,
        camera: u8,
        ccd: u8,
    },

    #[error("Reference construction failed: {0}")]
    ReferenceBuild(String),

    #[error("Stage {stage} failed for frame {frame}: {message}")]
    StageFailed {
        stage: String,
        frame: String,
        message: String,
    },

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("Registry connection lock poisoned")]
    LockPoisoned,
}

impl SubphotError {
    /// A uniqueness violation: the work was already recorded by someone else.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateRecord { .. })
    }

    /// Errors that abort a whole batch rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::LockPoisoned
                | Self::UnknownScope(_)
                | Self::InvalidConfig(_)
                | Self::ReferenceBuild(_)
                | Self::Pool(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SubphotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_only_affect_their_unit() {
        let err = SubphotError::StageFailed {
            stage: "align".into(),
            frame: "2018206192942-s0001-2-2-0120".into(),
            message: "exit status 3".into(),
        };
        assert!(!err.is_fatal());
        assert!(!err.is_duplicate());
        assert_eq!(
            err.to_string(),
            "Stage align failed for frame 2018206192942-s0001-2-2-0120: exit status 3"
        );
    }
}
