// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Static prompt context shared by the planner, the judge and the
//! tool-calling composer.

pub const WEFT_BACKGROUND: &str = "\
Weft syncs data from many third-party systems (CRMs, ticketing, messaging, \
storage, code hosts, calendars, drives) into searchable collections. Source \
records are normalized into entities, chunked, embedded and indexed. A chunk \
document carries its text, the entity name, breadcrumbs (the ancestor path \
inside the source), the source name, an entity type such as `slack.message`, \
and a `chunk_index` within its parent entity. Retrieval supports `semantic` \
(dense vectors; finds conceptually similar chunks), `keyword` (BM25 over the \
text; precise but misses paraphrases) and `hybrid` (both, fused). Filters \
narrow the corpus before ranking: conditions in a group are ANDed, groups \
are ORed. Use `semantic` when filtering by `original_entity_id` or \
`chunk_index` to retrieve all chunks of one document.";

pub const PLANNER_TASK: &str = "\
# Task

You are the search planner. Propose the next search against the collection: \
a keyword-optimized primary query, optional semantic variations, a retrieval \
strategy, pagination, and optional filter groups. Learn from the search \
history: do not repeat a plan that already returned nothing. Explain your \
choice in `reasoning`.";

pub const JUDGE_TASK: &str = "\
# Task

You are the search judge. Decide whether the current results suffice to \
answer the user's query. If they do, stop (`should_continue = false`), list \
the `useful_result_ids` worth returning, and quote the single most relevant \
sentence in `answer_snippet`. If they do not, continue and give the planner \
concrete `advice`. If the query execution errored, analyse the error in \
`error_analysis`; a malformed filter usually means the planner should drop \
or fix it.";

pub const COMPOSER_TASK: &str = "\
# Task

Answer the user's query by searching the collection with the `search` tool. \
Iterate: inspect results, refine queries and filters, and when you have \
enough evidence call `submit_answer` with the answer text and citations. If \
no direct answer exists, call `submit_answer` with a `consolidation_search` \
plan that re-retrieves the most relevant results you saw.";
