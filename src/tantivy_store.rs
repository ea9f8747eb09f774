//! Search-index [`ShopStore`] backed by tantivy.
//!
//! Each shop is one document. Names are indexed one character per token so
//! that a substring search is a phrase query over characters; this works
//! for CJK names where word tokenizers find nothing to split on. District,
//! type and tags are indexed as exact lowercase terms.
//!
//! Locations are indexed as every geohash prefix of the stored 12-character
//! hash. Radius search ORs the 3x3 covering block at the precision chosen
//! by [`proximity::covering_cells`], then filters candidates by exact
//! distance.
//!
//! tantivy is synchronous, so every call runs on the blocking pool. Writes
//! are serialized by the writer lock and committed before it is released.
//! Updates read the stored document after taking the lock, so concurrent
//! edits of one shop do not overwrite each other.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, PhraseQuery, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED,
    STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, Token, TokenStream, Tokenizer};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError, Term};
use tracing::debug;

use shopfinder_core::keyword::{self, KeywordQuery};
use shopfinder_core::models::{Coord, Location, Shop, ShopStatus};
use shopfinder_core::proximity;
use shopfinder_core::query::{self as adv, AdvQuery};
use shopfinder_core::store::{ShopStore, TagMaintenance};
use shopfinder_core::{StoreError, StoreResult};

const CHAR_TOKENIZER: &str = "shop_chars";
const WRITER_HEAP_BYTES: usize = 50_000_000;

const STATE_PHYSICAL: &str = "physical";
const STATE_ONLINE: &str = "online";
const STATE_MISSING: &str = "missing";

/// Emits every non-whitespace character as its own token.
#[derive(Clone, Default)]
pub struct CharTokenizer {
    token: Token,
}

pub struct CharTokenStream<'a> {
    chars: std::str::CharIndices<'a>,
    token: &'a mut Token,
}

impl Tokenizer for CharTokenizer {
    type TokenStream<'a> = CharTokenStream<'a>;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> CharTokenStream<'a> {
        self.token.reset();
        CharTokenStream {
            chars: text.char_indices(),
            token: &mut self.token,
        }
    }
}

impl TokenStream for CharTokenStream<'_> {
    fn advance(&mut self) -> bool {
        self.token.text.clear();
        // Whitespace still takes a position so "ab" does not match "a b".
        self.token.position = self.token.position.wrapping_add(1);
        for (offset, c) in self.chars.by_ref() {
            if c.is_whitespace() {
                self.token.position = self.token.position.wrapping_add(1);
                continue;
            }
            self.token.offset_from = offset;
            self.token.offset_to = offset + c.len_utf8();
            self.token.text.push(c);
            return true;
        }
        false
    }

    fn token(&self) -> &Token {
        self.token
    }

    fn token_mut(&mut self) -> &mut Token {
        self.token
    }
}

fn char_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(CharTokenizer::default())
        .filter(LowerCaser)
        .build()
}

#[derive(Clone, Copy)]
struct Fields {
    id: Field,
    name: Field,
    kind: Field,
    kind_key: Field,
    district: Field,
    district_key: Field,
    tag: Field,
    address: Field,
    url: Field,
    notes: Field,
    geohash: Field,
    cell: Field,
    state: Field,
    status: Field,
    listed: Field,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_i64_field("id", INDEXED | STORED | FAST);

    let name_indexing = TextFieldIndexing::default()
        .set_tokenizer(CHAR_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let name_options = TextOptions::default()
        .set_indexing_options(name_indexing)
        .set_stored();
    builder.add_text_field("name", name_options);

    builder.add_text_field("type", STORED);
    builder.add_text_field("type_key", STRING);
    builder.add_text_field("district", STORED);
    builder.add_text_field("district_key", STRING);
    builder.add_text_field("tag", STRING | STORED);
    builder.add_text_field("address", STORED);
    builder.add_text_field("url", STORED);
    builder.add_text_field("notes", STORED);
    builder.add_text_field("geohash", STORED);
    builder.add_text_field("cell", STRING);
    builder.add_text_field("location_state", STRING | STORED);
    builder.add_text_field("status", STRING | STORED);
    builder.add_text_field("listed", STRING);

    builder.build()
}

impl Fields {
    fn from_schema(schema: &Schema) -> Result<Self> {
        Ok(Self {
            id: schema.get_field("id")?,
            name: schema.get_field("name")?,
            kind: schema.get_field("type")?,
            kind_key: schema.get_field("type_key")?,
            district: schema.get_field("district")?,
            district_key: schema.get_field("district_key")?,
            tag: schema.get_field("tag")?,
            address: schema.get_field("address")?,
            url: schema.get_field("url")?,
            notes: schema.get_field("notes")?,
            geohash: schema.get_field("geohash")?,
            cell: schema.get_field("cell")?,
            state: schema.get_field("location_state")?,
            status: schema.get_field("status")?,
            listed: schema.get_field("listed")?,
        })
    }
}

struct Inner {
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
    next_id: AtomicI64,
}

/// tantivy implementation of the [`ShopStore`] trait.
pub struct TantivyStore {
    inner: Arc<Inner>,
}

impl TantivyStore {
    /// Open the index in `dir`, creating it if the directory is empty.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let directory = MmapDirectory::open(dir)?;
        let index = Index::open_or_create(directory, build_schema())?;
        Self::from_index(index)
    }

    /// A throwaway index held in memory.
    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        index.tokenizers().register(CHAR_TOKENIZER, char_analyzer());
        let fields = Fields::from_schema(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(WRITER_HEAP_BYTES)?;

        let inner = Inner {
            reader,
            writer: Mutex::new(writer),
            fields,
            next_id: AtomicI64::new(1),
        };
        let max_id = inner
            .search(&AllQuery)?
            .iter()
            .map(|s| s.id)
            .max()
            .unwrap_or(0);
        inner.next_id.store(max_id + 1, AtomicOrdering::SeqCst);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Bulk-write shops keeping their ids, replacing any document with the
    /// same id. Used to copy another backend into the index.
    pub async fn load(&self, shops: Vec<Shop>) -> StoreResult<u64> {
        self.run(move |inner| {
            let Some(max_id) = shops.iter().map(|s| s.id).max() else {
                return Ok(0);
            };
            inner.write(&shops)?;
            inner.next_id.fetch_max(max_id + 1, AtomicOrdering::SeqCst);
            Ok(shops.len() as u64)
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> StoreResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Other(e.into()))?
    }
}

fn index_err(err: TantivyError) -> StoreError {
    StoreError::Query(err.to_string())
}

fn term_query(field: Field, text: &str) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_text(field, text),
        IndexRecordOption::Basic,
    ))
}

fn exclude_closed(fields: &Fields, query: Box<dyn Query>) -> BooleanQuery {
    BooleanQuery::new(vec![
        (Occur::Must, query),
        (
            Occur::MustNot,
            term_query(fields.status, ShopStatus::Closed.as_str()),
        ),
    ])
}

impl Inner {
    fn search(&self, query: &dyn Query) -> StoreResult<Vec<Shop>> {
        let searcher = self.reader.searcher();
        let limit = (searcher.num_docs() as usize).max(1);
        let hits = searcher
            .search(query, &TopDocs::with_limit(limit))
            .map_err(index_err)?;

        let mut shops = Vec::with_capacity(hits.len());
        for (_score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address).map_err(index_err)?;
            shops.push(self.doc_to_shop(&doc)?);
        }
        Ok(shops)
    }

    fn find(&self, id: i64) -> StoreResult<Option<Shop>> {
        let query = TermQuery::new(
            Term::from_field_i64(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        Ok(self.search(&query)?.into_iter().next())
    }

    fn text(&self, doc: &TantivyDocument, field: Field) -> Option<String> {
        doc.get_first(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn doc_to_shop(&self, doc: &TantivyDocument) -> StoreResult<Shop> {
        let f = &self.fields;
        let id = doc
            .get_first(f.id)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StoreError::query("index document without id"))?;

        let location = match self.text(doc, f.state).as_deref() {
            Some(STATE_ONLINE) => Location::Online,
            _ => Location::from_geohash(self.text(doc, f.geohash).as_deref()),
        };
        let status: ShopStatus = self
            .text(doc, f.status)
            .unwrap_or_default()
            .parse()
            .map_err(StoreError::Query)?;
        let tags = doc
            .get_all(f.tag)
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>();

        Ok(Shop {
            id,
            name: self.text(doc, f.name).unwrap_or_default(),
            kind: self.text(doc, f.kind).unwrap_or_default(),
            district: self.text(doc, f.district).unwrap_or_default(),
            address: self.text(doc, f.address),
            url: self.text(doc, f.url),
            notes: self.text(doc, f.notes),
            tags: keyword::normalize_tags(tags),
            location,
            status,
            distance: None,
        })
    }

    fn shop_to_doc(&self, shop: &Shop) -> TantivyDocument {
        let f = &self.fields;
        let mut doc = TantivyDocument::default();
        doc.add_i64(f.id, shop.id);
        doc.add_text(f.name, &shop.name);
        doc.add_text(f.kind, &shop.kind);
        doc.add_text(f.kind_key, shop.kind.to_lowercase());
        doc.add_text(f.district, &shop.district);
        doc.add_text(f.district_key, shop.district.to_lowercase());
        for tag in keyword::normalize_tags(&shop.tags) {
            doc.add_text(f.tag, tag);
        }
        for (field, value) in [(f.address, &shop.address), (f.url, &shop.url), (f.notes, &shop.notes)] {
            if let Some(v) = crate::db::non_blank(value) {
                doc.add_text(field, v);
            }
        }

        let state = match (&shop.location, shop.stored_geohash()) {
            (_, Some(hash)) => {
                for len in 1..=hash.len() {
                    doc.add_text(f.cell, &hash[..len]);
                }
                doc.add_text(f.geohash, hash);
                STATE_PHYSICAL
            }
            (Location::Online, None) => STATE_ONLINE,
            _ => STATE_MISSING,
        };
        doc.add_text(f.state, state);
        doc.add_text(f.status, shop.status.as_str());
        doc.add_text(f.listed, if shop.is_listed() { "yes" } else { "no" });
        doc
    }

    fn write(&self, shops: &[Shop]) -> StoreResult<()> {
        let mut writer = self.writer.lock();
        self.write_locked(&mut writer, shops)
    }

    /// Replace documents by id and commit once. Rolls back on failure.
    ///
    /// The reader is reloaded before returning, so a caller still holding
    /// the writer lock reads its own commit.
    fn write_locked(&self, writer: &mut IndexWriter, shops: &[Shop]) -> StoreResult<()> {
        let staged = shops.iter().try_for_each(|shop| {
            writer.delete_term(Term::from_field_i64(self.fields.id, shop.id));
            writer.add_document(self.shop_to_doc(shop)).map(|_| ())
        });
        if let Err(e) = staged.and_then(|_| writer.commit().map(|_| ())) {
            writer.rollback().map_err(index_err)?;
            return Err(index_err(e));
        }
        self.reader.reload().map_err(index_err)
    }

    fn name_query(&self, text: &str) -> Box<dyn Query> {
        // Offsets mirror the tokenizer: one position per character.
        let mut terms: Vec<(usize, Term)> = text
            .chars()
            .enumerate()
            .filter(|(_, c)| !c.is_whitespace())
            .map(|(pos, c)| (pos, Term::from_field_text(self.fields.name, &c.to_string())))
            .collect();
        if terms.len() == 1 {
            let (_, term) = terms.remove(0);
            return Box::new(TermQuery::new(term, IndexRecordOption::Basic));
        }
        Box::new(PhraseQuery::new_with_offset(terms))
    }

    fn adv_term_query(&self, term: &adv::Term) -> Box<dyn Query> {
        let f = &self.fields;
        let text = term.text.as_str();
        match term.field {
            adv::Field::Name => self.name_query(text),
            adv::Field::District => term_query(f.district_key, text),
            adv::Field::Type => term_query(f.kind_key, text),
            adv::Field::Tag => term_query(f.tag, text),
            adv::Field::Any => Box::new(BooleanQuery::new(vec![
                (Occur::Should, term_query(f.tag, text)),
                (Occur::Should, self.name_query(text)),
                (Occur::Should, term_query(f.district_key, text)),
                (Occur::Should, term_query(f.kind_key, text)),
            ])),
        }
    }
}

fn by_id(mut shops: Vec<Shop>) -> Vec<Shop> {
    shops.sort_by_key(|s| s.id);
    shops
}

#[async_trait]
impl ShopStore for TantivyStore {
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
        let metres = proximity::parse_radius(radius)?;
        let origin = Coord::new(lat, lon);
        if !origin.is_valid() {
            return Err(StoreError::validation(format!("invalid point ({lat}, {lon})")));
        }
        let cells = proximity::covering_cells(origin, metres)?;
        debug!(cells = cells.len(), radius, "index proximity search");

        self.run(move |inner| {
            let any_cell = BooleanQuery::new(
                cells
                    .iter()
                    .map(|c| (Occur::Should, term_query(inner.fields.cell, c)))
                    .collect(),
            );
            let query = exclude_closed(&inner.fields, Box::new(any_cell));

            let mut found: Vec<Shop> = inner
                .search(&query)?
                .into_iter()
                .filter_map(|mut s| {
                    let d = proximity::haversine_m(origin, s.coord()?);
                    (d <= metres).then(|| {
                        s.distance = Some(d);
                        s
                    })
                })
                .collect();
            found.sort_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            Ok(found)
        })
        .await
    }

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
        let query = KeywordQuery::parse(text)?;

        self.run(move |inner| {
            let f = &inner.fields;
            let matcher: Box<dyn Query> = match &query {
                KeywordQuery::Single(term) => Box::new(BooleanQuery::new(vec![
                    (Occur::Should, term_query(f.tag, term)),
                    (Occur::Should, term_query(f.district_key, term)),
                    (Occur::Should, inner.name_query(term)),
                ])),
                KeywordQuery::AllTags(terms) => Box::new(BooleanQuery::new(
                    terms
                        .iter()
                        .map(|t| (Occur::Must, term_query(f.tag, t)))
                        .collect(),
                )),
            };
            let query = BooleanQuery::new(vec![
                (Occur::Must, Box::new(exclude_closed(f, matcher)) as Box<dyn Query>),
                (Occur::Must, term_query(f.listed, "yes")),
            ]);
            Ok(by_id(inner.search(&query)?))
        })
        .await
    }

    async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>> {
        let parsed = AdvQuery::parse(query)?;

        self.run(move |inner| {
            let mut clauses: Vec<(Occur, Box<dyn Query>)> = parsed
                .clauses()
                .iter()
                .map(|c| {
                    let occur = match c.occur {
                        adv::Occur::Must => Occur::Must,
                        adv::Occur::MustNot => Occur::MustNot,
                        adv::Occur::Should => Occur::Should,
                    };
                    (occur, inner.adv_term_query(&c.term))
                })
                .collect();
            clauses.push((
                Occur::MustNot,
                term_query(inner.fields.status, ShopStatus::Closed.as_str()),
            ));

            let mut found = by_id(inner.search(&BooleanQuery::new(clauses))?);
            found.sort_by_key(|s| std::cmp::Reverse(parsed.should_hits(s)));
            Ok(found)
        })
        .await
    }

    async fn shop_by_id(&self, id: i64) -> StoreResult<Shop> {
        self.run(move |inner| inner.find(id)?.ok_or(StoreError::NotFound(id)))
            .await
    }

    async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>> {
        self.run(|inner| {
            let query = exclude_closed(&inner.fields, term_query(inner.fields.state, STATE_MISSING));
            Ok(by_id(inner.search(&query)?))
        })
        .await
    }

    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
        let updates = shops.to_vec();
        self.run(move |inner| {
            // Read-modify-write under the writer lock.
            let mut writer = inner.writer.lock();
            let mut merged = Vec::with_capacity(updates.len());
            for update in &updates {
                let mut stored = inner.find(update.id)?.ok_or(StoreError::NotFound(update.id))?;
                stored.address = update.address.clone();
                stored.location = update.location.clone();
                merged.push(stored);
            }
            inner.write_locked(&mut writer, &merged)?;
            Ok(merged.len() as u64)
        })
        .await
    }

    async fn shop_count(&self) -> StoreResult<u64> {
        self.run(|inner| Ok(inner.reader.searcher().num_docs())).await
    }

    async fn districts(&self) -> StoreResult<Vec<String>> {
        self.run(|inner| {
            let open = inner.search(&exclude_closed(&inner.fields, Box::new(AllQuery)))?;
            let set: BTreeSet<String> = open
                .into_iter()
                .map(|s| s.district)
                .filter(|d| !d.trim().is_empty())
                .collect();
            Ok(set.into_iter().collect())
        })
        .await
    }

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
        let key = key.to_string();
        self.run(move |inner| {
            let vocab: BTreeSet<String> = inner
                .search(&AllQuery)?
                .into_iter()
                .flat_map(|s| s.tags)
                .collect();
            Ok(keyword::suggest(&key, vocab))
        })
        .await
    }

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
        let mut stored = shop.clone();
        self.run(move |inner| {
            stored.id = inner.next_id.fetch_add(1, AtomicOrdering::SeqCst);
            stored.distance = None;
            inner.write(std::slice::from_ref(&stored))?;
            Ok(stored.id)
        })
        .await
    }

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
        self.run(move |inner| {
            let mut writer = inner.writer.lock();
            let mut shop = inner.find(id)?.ok_or(StoreError::NotFound(id))?;
            shop.status = status;
            inner.write_locked(&mut writer, std::slice::from_ref(&shop))
        })
        .await
    }

    async fn all_shops(&self) -> StoreResult<Vec<Shop>> {
        self.run(|inner| Ok(by_id(inner.search(&AllQuery)?))).await
    }

    fn tag_maintenance(&self) -> Option<&dyn TagMaintenance> {
        Some(self)
    }
}

#[async_trait]
impl TagMaintenance for TantivyStore {
    async fn refresh_tags(&self) -> StoreResult<u64> {
        self.run(|inner| {
            let mut writer = inner.writer.lock();
            let retagged: Vec<Shop> = inner
                .search(&AllQuery)?
                .into_iter()
                .filter(|s| s.tags.is_empty())
                .filter_map(|mut s| {
                    let tags = keyword::default_tags(&s);
                    (!tags.is_empty()).then(|| {
                        s.tags = tags;
                        s
                    })
                })
                .collect();
            if !retagged.is_empty() {
                inner.write_locked(&mut writer, &retagged)?;
            }
            Ok(retagged.len() as u64)
        })
        .await
    }
}
