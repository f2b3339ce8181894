use std::fmt;

/// Severity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportType {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportType::Debug => "Debug",
            ReportType::Info => "Info",
            ReportType::Warning => "Warning",
            ReportType::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: ReportType,
    pub message: String,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Accumulates the human readable diagnostics of a batch operation. Nothing in a `ReportList`
/// aborts the operation that produced it.
#[derive(Debug, Clone, Default)]
pub struct ReportList {
    reports: Vec<Report>,
}

impl ReportList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report<S: Into<String>>(&mut self, kind: ReportType, message: S) {
        self.reports.push(Report {
            kind,
            message: message.into(),
        });
    }

    pub fn warning<S: Into<String>>(&mut self, message: S) {
        self.report(ReportType::Warning, message)
    }

    pub fn error<S: Into<String>>(&mut self, message: S) {
        self.report(ReportType::Error, message)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Report> {
        self.reports.iter()
    }

    /// Reports of exactly `kind`.
    pub fn of_kind(&self, kind: ReportType) -> impl Iterator<Item = &Report> {
        self.reports.iter().filter(move |r| r.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}

impl<'a> IntoIterator for &'a ReportList {
    type Item = &'a Report;
    type IntoIter = std::slice::Iter<'a, Report>;

    fn into_iter(self) -> Self::IntoIter {
        self.reports.iter()
    }
}

/// Sends a report to an optional sink. Passes accept `Option<&mut ReportList>` so callers can
/// ignore diagnostics.
pub(crate) fn report(reports: &mut Option<&mut ReportList>, kind: ReportType, message: String) {
    if let Some(reports) = reports.as_mut() {
        reports.report(kind, message);
    }
}
