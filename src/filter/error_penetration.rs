use super::{Filter, FilteredSpan};

/// Force-keeps every error span. Never drops anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorPenetration;

impl Filter for ErrorPenetration {
    fn name(&self) -> &str {
        "error_penetration"
    }

    fn filter(&self, mut spans: Vec<FilteredSpan>) -> Vec<FilteredSpan> {
        for s in spans.iter_mut().filter(|s| s.span.error) {
            s.force_keep = true;
        }
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Span;

    #[test]
    fn test_marks_only_error_spans() {
        let input = vec![
            FilteredSpan::new(Span::new("a", "x").with_error(true)),
            FilteredSpan::new(Span::new("a", "y")),
        ];
        let out = ErrorPenetration.filter(input);
        assert_eq!(out.len(), 2);
        assert!(out[0].force_keep);
        assert!(!out[1].force_keep);
    }
}
