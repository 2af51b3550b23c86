use anyhow::{bail, Context, Result};
use futures::future::join_all;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use periodicals_sync::{
    BookmarkSync, DownloadRegistry, Downloader, EditionId, FileStore, FileType, HttpFileSource,
    HttpReaderApi, LastPage, LocalStore, PositionSync, ProgressEntry, ProgressLedger,
    ProgressSummary, Snapshot,
};

use crate::cli::Settings;

pub async fn open_store(settings: &Settings) -> Result<Arc<LocalStore>> {
    let path = settings.store_path();
    let store = LocalStore::open(&path)
        .await
        .with_context(|| format!("Failed to open local store {:?}", path))?;
    Ok(Arc::new(store))
}

async fn build_downloader(settings: &Settings, store: &LocalStore) -> Result<Downloader> {
    let username = store.username().await;
    let files = FileStore::new(settings.files_dir(), username.as_deref());
    let downloaded = store
        .downloaded_editions()
        .await
        .context("Failed to read downloaded editions")?;
    let ledger = ProgressLedger::with_completed(downloaded.iter().map(|e| e.edition_id));
    let source = HttpFileSource::new(settings.api_url.clone(), settings.token.clone());
    Ok(Downloader::new(Arc::new(source), files, ledger, settings.concurrency))
}

fn build_sync(settings: &Settings, store: Arc<LocalStore>) -> Arc<BookmarkSync> {
    let api = HttpReaderApi::new(settings.api_url.clone(), settings.token.clone());
    Arc::new(BookmarkSync::new(store, Arc::new(api)))
}

fn publication_prefix(publication: &str) -> String {
    format!("{}/", publication)
}

pub async fn run_downloads(settings: &Settings, editions: Vec<EditionId>, publication: String) -> Result<()> {
    let store = open_store(settings).await?;
    let downloader = build_downloader(settings, &store).await?;
    let prefix = publication_prefix(&publication);
    let editions: BTreeSet<EditionId> = editions.into_iter().collect();

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let mut view = ProgressView::new(&multi_progress, editions.len());
    let mut subscription = downloader.ledger().subscribe();

    let mut handles = vec![];
    for &id in &editions {
        let store = store.clone();
        let publication = publication.clone();
        let handle = downloader.download(id, &prefix, FileType::Pdf, move || async move {
            if let Err(err) = store.mark_downloaded(id, &publication).await {
                warn!(id, error = %err, "failed to record downloaded edition");
            }
        });
        handles.extend(handle);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            snapshot = subscription.next() => {
                let Some(snapshot) = snapshot else { break };
                view.render(&snapshot, &editions);
                let settled = editions
                    .iter()
                    .all(|id| !matches!(snapshot.get(id), Some(ProgressEntry::Loading { .. })));
                if settled && downloader.are_all_loadings_complete() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                for &id in &editions {
                    downloader.cancel_download(id);
                }
            }
        }
    }

    let outcomes = join_all(handles.into_iter().map(|handle| async move {
        let id = handle.id();
        (id, handle.wait().await)
    }))
    .await;

    let mut failures = 0;
    for (id, outcome) in outcomes {
        if let Err(err) = outcome {
            eprintln!("Failed to download {}: {}", id, err);
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{} of {} downloads failed", failures, editions.len());
    }
    Ok(())
}

struct ProgressView<'a> {
    multi_progress: &'a MultiProgress,
    header: ProgressBar,
    bars: HashMap<EditionId, ProgressBar>,
    total_files: usize,
}

impl<'a> ProgressView<'a> {
    fn new(multi_progress: &'a MultiProgress, total_files: usize) -> Self {
        let header = multi_progress.add(ProgressBar::new(0));
        header.set_style(ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar()));
        Self {
            multi_progress,
            header,
            bars: HashMap::new(),
            total_files,
        }
    }

    fn bar(&mut self, id: EditionId) -> &ProgressBar {
        let multi_progress = self.multi_progress;
        self.bars.entry(id).or_insert_with(|| {
            let pb = multi_progress.add(ProgressBar::new(0));
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {msg}",
            )
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb.set_message(format!("Downloading {}", id));
            pb
        })
    }

    fn render(&mut self, snapshot: &Snapshot, editions: &BTreeSet<EditionId>) {
        let mut done = 0;
        for &id in editions {
            let Some(entry) = snapshot.get(&id).copied() else { continue };
            let pb = self.bar(id);
            if pb.is_finished() {
                done += 1;
                continue;
            }
            match entry {
                ProgressEntry::Loading { current, total } => {
                    pb.set_length(total.max(current));
                    pb.set_position(current);
                }
                ProgressEntry::Success => {
                    pb.finish_with_message(format!("Completed   {}", id));
                    done += 1;
                }
                ProgressEntry::Error(kind) => {
                    pb.abandon_with_message(format!("Failed      {} ({})", id, kind));
                    done += 1;
                }
            }
        }
        let summary = ProgressSummary::of(snapshot);
        self.header.set_message(format!(
            "Summary: Files: {}/{} | Downloaded: {} / {} ({}%)",
            done,
            self.total_files,
            HumanBytes(summary.current),
            HumanBytes(summary.total),
            summary.percent()
        ));
    }
}

pub async fn delete_edition(settings: &Settings, edition: EditionId, publication: String) -> Result<()> {
    let store = open_store(settings).await?;
    let downloader = build_downloader(settings, &store).await?;
    let registry = store.clone();
    let deleted = downloader
        .delete_file(edition, &publication_prefix(&publication), FileType::Pdf, move || async move {
            if let Err(err) = registry.clear_downloaded(edition).await {
                warn!(edition, error = %err, "failed to clear downloaded flag");
            }
        })
        .await;
    if !deleted {
        bail!("Failed to delete edition {}", edition);
    }
    println!("Deleted edition {}", edition);
    Ok(())
}

pub async fn list_downloads(settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let downloader = build_downloader(settings, &store).await?;
    let downloaded = store.downloaded_editions().await?;
    if downloaded.is_empty() {
        println!("No downloaded editions in {:?}.", downloader.files().root());
        return Ok(());
    }

    println!("{:<10} {:<20} {:<18} {:<12} {}", "Edition", "Publication", "Downloaded", "Size", "Path");
    println!("{:-<10} {:-<20} {:-<18} {:-<12} {:-<20}", "", "", "", "", "");
    for edition in downloaded {
        let path = downloader.file_for_reading(edition.edition_id, &edition.publication_id);
        let size = match tokio::fs::metadata(&path).await {
            Ok(metadata) => format!("{}", HumanBytes(metadata.len())),
            Err(_) => "missing".to_string(),
        };
        println!(
            "{:<10} {:<20} {:<18} {:<12} {}",
            edition.edition_id,
            edition.publication_id,
            edition.downloaded_at.format("%Y-%m-%d %H:%M").to_string(),
            size,
            path.display()
        );
    }
    Ok(())
}

pub async fn bookmarks(
    settings: &Settings,
    edition: EditionId,
    add: Option<u32>,
    remove: Option<u32>,
    sync_now: bool,
) -> Result<()> {
    let store = open_store(settings).await?;
    let sync = build_sync(settings, store);
    let position = PositionSync::spawn(sync.clone(), Duration::from_millis(settings.quiet_period_ms));

    if let Some(page) = add {
        sync.add_bookmark(edition, page).await?;
        position.bookmark_touched(edition);
    }
    if let Some(page) = remove {
        let current = sync.bookmarks(edition).await?;
        match current.iter().find(|b| b.page == page) {
            Some(bookmark) => {
                sync.remove_bookmark(bookmark).await?;
                position.bookmark_touched(edition);
            }
            None => println!("No bookmark on page {}", page),
        }
    }
    if sync_now {
        sync.sync_all_bookmarks(edition)
            .await
            .context("Bookmark synchronization failed")?;
    }
    position.shutdown().await;

    let list = sync.bookmarks(edition).await?;
    println!("{:<8} {:<8} {}", "Page", "Local", "Server");
    for bookmark in list {
        let server = bookmark
            .server_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<8} {}", bookmark.page, bookmark.local_id, server);
    }
    Ok(())
}

pub async fn read(settings: &Settings, edition: EditionId, pages: Vec<u32>) -> Result<()> {
    let store = open_store(settings).await?;
    let sync = build_sync(settings, store);

    match sync.api().last_page(edition).await {
        Ok(last) => println!("Last read page on server: {}", last.page),
        Err(err) => warn!(edition, error = %err, "could not fetch last read page"),
    }

    let position = PositionSync::spawn(sync, Duration::from_millis(settings.quiet_period_ms));
    for page in pages {
        position.page_changed(LastPage {
            edition_id: edition,
            page,
        });
    }
    position.shutdown().await;
    Ok(())
}

pub async fn set_login_name(settings: &Settings, username: String) -> Result<()> {
    let store = open_store(settings).await?;
    store.set_username(&username).await?;
    println!("Files for {} are stored under {:?}", username, FileStore::new(settings.files_dir(), Some(&username)).root());
    Ok(())
}
