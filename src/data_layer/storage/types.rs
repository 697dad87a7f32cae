/// Attributes of a stored object, as returned by `list`.
#[derive(Debug, Clone)]
pub struct ObjectAttrs {
    pub key: String,
    pub size: i64,
    pub last_modified_epoch_secs: i64,
}
