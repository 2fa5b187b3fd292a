pub(crate) mod branch_predictor;
pub(crate) mod fetch;
