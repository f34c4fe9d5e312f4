//! Well-known pipelines resolvable by name alone.

use crate::error::PretrainedError;
use std::fmt;
use std::str::FromStr;

/// Pipelines published for English under a fixed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredefinedPipeline {
    ExplainDocumentMl,
    ExplainDocumentDl,
    RecognizeEntitiesDl,
    CheckSpelling,
    MatchDatetime,
}

impl PredefinedPipeline {
    pub const ALL: [PredefinedPipeline; 5] = [
        PredefinedPipeline::ExplainDocumentMl,
        PredefinedPipeline::ExplainDocumentDl,
        PredefinedPipeline::RecognizeEntitiesDl,
        PredefinedPipeline::CheckSpelling,
        PredefinedPipeline::MatchDatetime,
    ];

    /// Registry name of the pipeline.
    pub fn name(&self) -> &'static str {
        match self {
            PredefinedPipeline::ExplainDocumentMl => "explain_document_ml",
            PredefinedPipeline::ExplainDocumentDl => "explain_document_dl",
            PredefinedPipeline::RecognizeEntitiesDl => "recognize_entities_dl",
            PredefinedPipeline::CheckSpelling => "check_spelling",
            PredefinedPipeline::MatchDatetime => "match_datetime",
        }
    }

    pub fn language(&self) -> &'static str {
        "en"
    }
}

impl fmt::Display for PredefinedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PredefinedPipeline {
    type Err = PretrainedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|pipeline| pipeline.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PretrainedError::Validation {
                field: "pipeline".to_string(),
                message: format!("unknown predefined pipeline {:?}", s),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for pipeline in PredefinedPipeline::ALL {
            assert_eq!(pipeline.name().parse::<PredefinedPipeline>().unwrap(), pipeline);
            assert_eq!(pipeline.language(), "en");
        }
        assert_eq!(
            "Check_Spelling".parse::<PredefinedPipeline>().unwrap(),
            PredefinedPipeline::CheckSpelling
        );
        assert!("explain_everything".parse::<PredefinedPipeline>().is_err());
    }
}
