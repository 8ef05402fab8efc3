/// Tag stored with every row; one table can hold several kinds of graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphType {
    GraphiteMetrics,
}

impl GraphType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphType::GraphiteMetrics => "graphite_metrics",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "graphite_metrics" => Some(GraphType::GraphiteMetrics),
            _ => None,
        }
    }
}

/// Flattened form of one flame graph node in one persisted snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub timestamp: i64,
    pub graph_type: GraphType,
    pub cluster: String,
    pub id: u64,
    pub name: String,
    pub total: u64,
    pub value: u64,
    pub children_ids: Vec<u64>,  // Stored as a JSON array text column
}
