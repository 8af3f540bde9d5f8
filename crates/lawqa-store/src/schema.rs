//! Database schema definitions.

/// Main schema SQL for initializing the database.
pub const SCHEMA: &str = r#"
-- Passages table
CREATE TABLE IF NOT EXISTS passages (
    id TEXT PRIMARY KEY,
    law TEXT NOT NULL,
    chapter TEXT NOT NULL,
    section TEXT NOT NULL,
    article_no TEXT NOT NULL,
    article_title TEXT NOT NULL,
    clause_no TEXT,
    point TEXT,
    clause_head TEXT NOT NULL,
    text TEXT NOT NULL,
    enriched_text TEXT NOT NULL,
    citation TEXT NOT NULL,
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_passages_article ON passages(law, article_no);

-- FTS5 virtual table for lexical search over the locator fields and text
CREATE VIRTUAL TABLE IF NOT EXISTS passages_fts USING fts5(
    article_no,
    article_title,
    clause_no,
    point,
    clause_head,
    text,
    content=passages,
    content_rowid=rowid,
    tokenize='unicode61 remove_diacritics 0'
);

-- Triggers to keep FTS5 in sync with passages table
CREATE TRIGGER IF NOT EXISTS passages_ai AFTER INSERT ON passages BEGIN
    INSERT INTO passages_fts(rowid, article_no, article_title, clause_no, point, clause_head, text)
    VALUES (NEW.rowid, NEW.article_no, NEW.article_title, NEW.clause_no, NEW.point, NEW.clause_head, NEW.text);
END;

CREATE TRIGGER IF NOT EXISTS passages_ad AFTER DELETE ON passages BEGIN
    INSERT INTO passages_fts(passages_fts, rowid, article_no, article_title, clause_no, point, clause_head, text)
    VALUES ('delete', OLD.rowid, OLD.article_no, OLD.article_title, OLD.clause_no, OLD.point, OLD.clause_head, OLD.text);
END;

CREATE TRIGGER IF NOT EXISTS passages_au AFTER UPDATE ON passages BEGIN
    INSERT INTO passages_fts(passages_fts, rowid, article_no, article_title, clause_no, point, clause_head, text)
    VALUES ('delete', OLD.rowid, OLD.article_no, OLD.article_title, OLD.clause_no, OLD.point, OLD.clause_head, OLD.text);
    INSERT INTO passages_fts(rowid, article_no, article_title, clause_no, point, clause_head, text)
    VALUES (NEW.rowid, NEW.article_no, NEW.article_title, NEW.clause_no, NEW.point, NEW.clause_head, NEW.text);
END;
"#;

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;
