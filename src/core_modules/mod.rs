pub mod codebook;
pub mod connected_feature;
pub mod feature_aggregator;
pub mod feature_table;
pub mod labeling;
pub mod metric;
pub mod metric_decoder;
pub mod pixel_vectorizer;
pub mod tensor;
