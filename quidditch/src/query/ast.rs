use serde::{Deserialize, Serialize};

/// Typed half-open or closed numeric interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange<T> {
    pub lower: Option<T>,
    pub upper: Option<T>,
    pub include_lower: bool,
    pub include_upper: bool,
}

impl<T: Copy + PartialOrd> NumericRange<T> {
    pub fn contains(&self, value: T) -> bool {
        if let Some(lower) = self.lower {
            if value < lower || (!self.include_lower && value == lower) {
                return false;
            }
        }
        if let Some(upper) = self.upper {
            if value > upper || (!self.include_upper && value == upper) {
                return false;
            }
        }
        true
    }
}

/// Range bounds carry the field's numeric kind so a float field can never
/// be probed through an integer code path (or vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeBounds {
    I64(NumericRange<i64>),
    F64(NumericRange<f64>),
    /// Epoch milliseconds.
    Date(NumericRange<i64>),
}

/// Query AST. A tagged sum of the closed clause set plus one open
/// user-defined expression variant whose payload is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryAst {
    MatchAll,
    Term {
        field: String,
        value: String,
    },
    Match {
        field: String,
        text: String,
    },
    Phrase {
        field: String,
        text: String,
        slop: u32,
    },
    Range {
        field: String,
        bounds: RangeBounds,
    },
    Prefix {
        field: String,
        value: String,
    },
    Wildcard {
        field: String,
        pattern: String,
    },
    Fuzzy {
        field: String,
        value: String,
        max_edits: u8,
    },
    Bool {
        must: Vec<QueryAst>,
        should: Vec<QueryAst>,
        must_not: Vec<QueryAst>,
        filter: Vec<QueryAst>,
        minimum_should_match: Option<u32>,
    },
    UserDefined {
        module: String,
        payload: Vec<u8>,
    },
}

impl QueryAst {
    pub fn bool() -> QueryAst {
        QueryAst::Bool {
            must: Vec::new(),
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        }
    }

    pub fn query_type(&self) -> &'static str {
        match self {
            QueryAst::MatchAll => "match_all",
            QueryAst::Term { .. } => "term",
            QueryAst::Match { .. } => "match",
            QueryAst::Phrase { .. } => "phrase",
            QueryAst::Range { .. } => "range",
            QueryAst::Prefix { .. } => "prefix",
            QueryAst::Wildcard { .. } => "wildcard",
            QueryAst::Fuzzy { .. } => "fuzzy",
            QueryAst::Bool { .. } => "bool",
            QueryAst::UserDefined { .. } => "user_defined",
        }
    }

    /// Canonical form: clause lists inside `bool` containers sorted by their
    /// serialized shape, so semantically-equal queries share a plan-cache
    /// fingerprint.
    pub fn normalize(&self) -> QueryAst {
        match self {
            QueryAst::Bool {
                must,
                should,
                must_not,
                filter,
                minimum_should_match,
            } => {
                let canon = |clauses: &[QueryAst]| {
                    let mut normalized: Vec<QueryAst> =
                        clauses.iter().map(|c| c.normalize()).collect();
                    normalized.sort_by_key(|c| {
                        serde_json::to_string(c).unwrap_or_default()
                    });
                    normalized
                };
                QueryAst::Bool {
                    must: canon(must),
                    should: canon(should),
                    must_not: canon(must_not),
                    filter: canon(filter),
                    minimum_should_match: *minimum_should_match,
                }
            }
            other => other.clone(),
        }
    }

    /// Pull conjunctive filter clauses out for native push-down: every
    /// `filter` clause reachable through chains of `must`/`filter` contexts
    /// is removed from the tree and returned separately. Disjunctive
    /// contexts (`should`, `must_not`) are left untouched.
    pub fn split_pushed_filters(self) -> (QueryAst, Vec<QueryAst>) {
        match self {
            QueryAst::Bool {
                must,
                should,
                must_not,
                filter,
                minimum_should_match,
            } => {
                let mut pushed = filter;
                let mut kept_must = Vec::with_capacity(must.len());
                for clause in must {
                    let (kept, nested) = clause.split_pushed_filters();
                    pushed.extend(nested);
                    kept_must.push(kept);
                }
                let node = QueryAst::Bool {
                    must: kept_must,
                    should,
                    must_not,
                    filter: Vec::new(),
                    minimum_should_match,
                };
                (node.simplify(), pushed)
            }
            other => (other, Vec::new()),
        }
    }

    /// Collapse a bool node whose clause sets all emptied out.
    fn simplify(self) -> QueryAst {
        if let QueryAst::Bool {
            must,
            should,
            must_not,
            filter,
            ..
        } = &self
        {
            if must.is_empty() && should.is_empty() && must_not.is_empty() && filter.is_empty() {
                return QueryAst::MatchAll;
            }
        }
        self
    }
}
