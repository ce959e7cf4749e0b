pub const SCHEMA: &str = "\

CREATE TABLE db_params (
    version INTEGER NOT NULL
);

CREATE TABLE signing_records (
    key BLOB UNIQUE NOT NULL,
    value BLOB NOT NULL
);

CREATE TABLE signing_totals (
    total INTEGER NOT NULL
);

";
